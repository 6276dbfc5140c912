//! `coalesce dev` command implementation.
//!
//! Reference dev server for the cached module bundle:
//!
//! ```text
//! Browser requests GET /src/app.js
//!   → read from disk
//!   → record in the module graph
//!   → convert to System.register (worker pool)
//!   → serve as application/javascript
//!
//! Browser requests GET /@coalesce/modules.js?v=<version>
//!   → every module converted so far, in one response
//! ```
//!
//! File changes soft-invalidate the changed modules, announce them to the
//! page over the HMR socket, then reload it.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path as AxumPath, RawQuery, State,
    },
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use coalesce_core::hmr::{self, HmrMessage};
use coalesce_core::url::normalize_url;
use coalesce_core::{
    ClientAssets, CoalescePlugin, MemoryModuleGraph, PluginOptions, VirtualResponse, VirtualRoute,
};
use miette::{IntoDiagnostic, Result};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Dev server action.
#[derive(Debug, Clone)]
pub struct DevAction {
    /// Entry module, relative to `cwd`.
    pub entry: PathBuf,
    /// Working directory (project root).
    pub cwd: PathBuf,
    /// Port to listen on.
    pub port: u16,
    /// Host to bind to.
    pub host: String,
    /// Explicit config file path.
    pub config: Option<PathBuf>,
    /// Serve modules individually only.
    pub no_coalesce: bool,
}

/// Shared server state.
struct DevState {
    /// Broadcast channel for HMR messages.
    hmr_tx: broadcast::Sender<HmrMessage>,
    /// Project root.
    cwd: PathBuf,
    /// Bound port (for the HMR client).
    port: u16,
    /// Every module served so far.
    graph: Arc<MemoryModuleGraph>,
    /// `None` when running without the cached bundle.
    plugin: Option<CoalescePlugin>,
    /// Index page before plugin injection.
    base_html: String,
}

impl DevState {
    /// Index page with the current bundle version and invalidated set.
    fn index_html(&self) -> String {
        match &self.plugin {
            Some(plugin) => plugin.transform_index_html(&self.base_html),
            None => self.base_html.clone(),
        }
    }
}

/// Run the dev server.
pub async fn run(action: DevAction) -> Result<()> {
    let cwd = action.cwd.canonicalize().into_diagnostic()?;

    let options = PluginOptions::load(&cwd, action.config.as_deref()).into_diagnostic()?;
    let plugin = if action.no_coalesce || !options.enabled {
        info!("cached module bundle disabled");
        None
    } else {
        match ClientAssets::load(&cwd, &options) {
            Ok(assets) => Some(CoalescePlugin::new(options, assets).into_diagnostic()?),
            Err(e) => {
                warn!(error = %e, "serving modules individually");
                None
            }
        }
    };

    let host_ip = if action.host == "localhost" {
        "127.0.0.1".to_string()
    } else {
        action.host.clone()
    };
    let addr: SocketAddr = format!("{}:{}", host_ip, action.port)
        .parse()
        .into_diagnostic()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .into_diagnostic()?;
    let local_addr = listener.local_addr().into_diagnostic()?;

    let entry_url = format!("/{}", action.entry.display());
    let base_html = load_index_html(&cwd, &entry_url, plugin.is_some());

    let (hmr_tx, _) = broadcast::channel::<HmrMessage>(16);
    let bundle_url = plugin.as_ref().map(|p| p.options().bundle_url.clone());

    let state = Arc::new(DevState {
        hmr_tx,
        cwd: cwd.clone(),
        port: local_addr.port(),
        graph: Arc::new(MemoryModuleGraph::new()),
        plugin,
        base_html,
    });

    // File watcher
    let (file_change_tx, mut file_change_rx) = mpsc::channel::<Vec<PathBuf>>(16);
    let watch_cwd = cwd.clone();
    std::thread::spawn(move || {
        if let Err(e) = watch_files(watch_cwd, file_change_tx) {
            warn!(error = %e, "file watcher stopped");
        }
    });

    let change_state = state.clone();
    tokio::spawn(async move {
        while let Some(changed) = file_change_rx.recv().await {
            handle_file_change(&change_state, changed);
        }
    });

    let app = Router::new()
        .route("/", get(serve_index))
        .route(hmr::HMR_SOCKET_PATH, get(hmr_websocket))
        .route(hmr::HMR_CLIENT_PATH, get(serve_hmr_client))
        .route("/*path", get(serve_module))
        .layer(CorsLayer::permissive())
        .with_state(state);

    println!();
    println!("  Dev server running at http://{}", local_addr);
    match bundle_url {
        Some(url) => println!("  Cached module bundle at {}", url),
        None => println!("  Serving modules individually"),
    }
    println!();

    axum::serve(listener, app).await.into_diagnostic()?;

    Ok(())
}

/// The project's `index.html` with the HMR client added, or a generated page
/// importing `entry_url`.
fn load_index_html(cwd: &Path, entry_url: &str, coalesced: bool) -> String {
    let hmr_script = format!(r#"<script type="module" src="{}"></script>"#, hmr::HMR_CLIENT_PATH);

    let Ok(mut html) = std::fs::read_to_string(cwd.join("index.html")) else {
        return generate_index_html(entry_url, &hmr_script, coalesced);
    };

    if !html.contains(hmr::HMR_CLIENT_PATH) {
        if let Some(pos) = html.find("</head>") {
            html.insert_str(pos, &format!("  {}\n  ", hmr_script));
        } else if let Some(pos) = html.find("</body>") {
            html.insert_str(pos, &format!("  {}\n  ", hmr_script));
        } else {
            html.push_str(&format!("\n{}", hmr_script));
        }
    }
    html
}

fn generate_index_html(entry_url: &str, hmr_script: &str, coalesced: bool) -> String {
    // Converted modules only run inside the loader.
    let entry_script = if coalesced {
        format!("<script>System.import('{}');</script>", entry_url)
    } else {
        format!(r#"<script type="module" src="{}"></script>"#, entry_url)
    };

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <title>coalesce</title>
    {hmr_script}
  </head>
  <body>
    <div id="app"></div>
    {entry_script}
  </body>
</html>
"#
    )
}

// ============================================================================
// Route Handlers
// ============================================================================

type AppState = Arc<DevState>;

async fn serve_index(State(state): State<AppState>) -> Html<String> {
    Html(state.index_html())
}

/// Serve the HMR client runtime at `/@hmr-client`.
async fn serve_hmr_client(State(state): State<AppState>) -> Response {
    javascript(hmr::client_runtime(state.port))
}

/// Serve the virtual routes, JS modules and static files.
///
/// Non-file routes (no extension) fall back to the index page.
async fn serve_module(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let url_path = format!("/{}", path);

    if let Some(plugin) = &state.plugin {
        match plugin.route(&url_path) {
            Some(VirtualRoute::Bundle) => return virtual_response(plugin.serve_bundle(state.graph.clone())),
            Some(VirtualRoute::SourceMap) => return virtual_response(plugin.serve_source_map().await),
            None => {}
        }
    }

    let ext = Path::new(&path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match ext {
        "js" | "mjs" => serve_script(&state, &path, query.as_deref()).await,
        _ => serve_static(&state, &path, ext),
    }
}

/// Serve a JS module, converted through the plugin when it is enabled.
async fn serve_script(state: &DevState, path: &str, query: Option<&str>) -> Response {
    let file = state.cwd.join(path);
    let Ok(code) = tokio::fs::read_to_string(&file).await else {
        return not_found(path);
    };

    let Some(plugin) = &state.plugin else {
        return javascript(code);
    };

    let raw_url = match query {
        Some(q) => format!("/{}?{}", path, q),
        None => format!("/{}", path),
    };
    let url = normalize_url(&raw_url);
    // The id keeps the query so worker entries stay recognisable.
    let id = match url.find('?') {
        Some(q) => format!("{}{}", file.display(), &url[q..]),
        None => file.display().to_string(),
    };

    state.graph.ensure_module(&id, &url, Some(file));
    let result = plugin.transform(code, &id, state.graph.as_ref()).await;
    state.graph.set_transform_result(&id, result.clone());
    debug!(module = %url, "served module");

    javascript(result.code)
}

fn serve_static(state: &DevState, path: &str, ext: &str) -> Response {
    let file_path = state.cwd.join(path);
    if file_path.is_file() {
        let content_type = match ext {
            "html" => "text/html",
            "css" => "text/css",
            "json" => "application/json",
            "map" => "application/json",
            "svg" => "image/svg+xml",
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "ico" => "image/x-icon",
            "woff" => "font/woff",
            "woff2" => "font/woff2",
            "wasm" => "application/wasm",
            _ => "application/octet-stream",
        };
        match std::fs::read(&file_path) {
            Ok(bytes) => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
            Err(_) => not_found(path),
        }
    } else if ext.is_empty() {
        // SPA fallback: client-side route.
        Html(state.index_html()).into_response()
    } else {
        not_found(path)
    }
}

fn javascript(code: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/javascript"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        code,
    )
        .into_response()
}

fn virtual_response(response: VirtualResponse) -> Response {
    (
        [
            (header::CONTENT_TYPE, response.content_type.to_string()),
            (header::CACHE_CONTROL, response.cache_control),
        ],
        response.body.to_string(),
    )
        .into_response()
}

fn not_found(path: &str) -> Response {
    (StatusCode::NOT_FOUND, format!("Not found: {}", path)).into_response()
}

// ============================================================================
// WebSocket HMR
// ============================================================================

async fn hmr_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_hmr_socket(socket, state))
}

/// Forward server messages to the page and client events to the plugin.
async fn handle_hmr_socket(mut socket: WebSocket, state: Arc<DevState>) {
    let mut rx = state.hmr_tx.subscribe();

    let _ = socket
        .send(Message::Text(HmrMessage::Connected.to_json()))
        .await;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(msg) => {
                    if socket.send(Message::Text(msg.to_json())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "hmr socket lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match classify_incoming(incoming) {
                Incoming::Frame(text) => handle_client_message(&state, &text),
                Incoming::Ignored => {}
                Incoming::Closed => break,
            },
        }
    }
}

/// What the socket loop does with one read from the page.
#[derive(Debug, PartialEq, Eq)]
enum Incoming {
    Frame(String),
    Ignored,
    Closed,
}

fn classify_incoming(incoming: Option<Result<Message, axum::Error>>) -> Incoming {
    match incoming {
        Some(Ok(Message::Text(text))) => Incoming::Frame(text),
        Some(Ok(Message::Close(_)) | Err(_)) | None => Incoming::Closed,
        Some(Ok(_)) => Incoming::Ignored,
    }
}

fn handle_client_message(state: &DevState, text: &str) {
    let Some(HmrMessage::Custom { event, .. }) = HmrMessage::parse(text) else {
        return;
    };
    match &state.plugin {
        Some(plugin) => {
            if let Some(version) = plugin.on_client_event(&event) {
                debug!(version = %version, "cache version bumped");
            }
        }
        None => debug!(event = %event, "ignoring client event"),
    }
}

// ============================================================================
// File Watching
// ============================================================================

/// Check if a path should be ignored by the file watcher.
fn should_ignore(path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    if path_str.contains("/node_modules/")
        || path_str.contains("/target/")
        || path_str.contains("/.git/")
        || path_str.contains("/dist/")
    {
        return true;
    }

    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}

fn is_watched(path: &Path) -> bool {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    !should_ignore(path) && matches!(ext, "js" | "mjs" | "ts" | "mts" | "jsx" | "css" | "json" | "html")
}

/// Quiet period after the last change before a batch is sent.
const DEBOUNCE: Duration = Duration::from_millis(50);

/// Collects changed paths until no change has arrived for `window`.
#[derive(Debug)]
struct Debouncer {
    window: Duration,
    pending: HashSet<PathBuf>,
    last_change: Option<Instant>,
}

impl Debouncer {
    fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashSet::new(),
            last_change: None,
        }
    }

    /// Record the watched paths among `paths`.
    fn push(&mut self, paths: impl IntoIterator<Item = PathBuf>, now: Instant) {
        let before = self.pending.len();
        self.pending.extend(paths.into_iter().filter(|p| is_watched(p)));
        if self.pending.len() > before {
            self.last_change = Some(now);
        }
    }

    /// How long to wait for more events before the pending batch is due.
    /// `None` when nothing is pending.
    fn wait_time(&self, now: Instant) -> Option<Duration> {
        if self.pending.is_empty() {
            return None;
        }
        let last = self.last_change?;
        Some(self.window.saturating_sub(now.duration_since(last)))
    }

    /// The pending batch, once the quiet period has passed.
    fn take_due(&mut self, now: Instant) -> Option<Vec<PathBuf>> {
        if self.wait_time(now)? > Duration::ZERO {
            return None;
        }
        self.last_change = None;
        let mut changed: Vec<PathBuf> = self.pending.drain().collect();
        changed.sort();
        Some(changed)
    }
}

/// Watch the project for changes, sending debounced batches of paths.
fn watch_files(cwd: PathBuf, file_change_tx: mpsc::Sender<Vec<PathBuf>>) -> Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(tx, Config::default()).into_diagnostic()?;
    watcher
        .watch(&cwd, RecursiveMode::Recursive)
        .into_diagnostic()?;

    let mut debouncer = Debouncer::new(DEBOUNCE);

    loop {
        let received = match debouncer.wait_time(Instant::now()) {
            Some(wait) => rx.recv_timeout(wait),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Ok(event)) => debouncer.push(event.paths, Instant::now()),
            Ok(Err(e)) => warn!(error = %e, "watch error"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Some(changed) = debouncer.take_due(Instant::now()) {
            if file_change_tx.blocking_send(changed).is_err() {
                break;
            }
        }
    }

    Ok(())
}

/// Soft-invalidate the changed modules, announce them, then reload.
fn handle_file_change(state: &DevState, changed: Vec<PathBuf>) {
    let mut invalidated = Vec::new();
    for path in &changed {
        info!(
            "File changed: {}",
            path.strip_prefix(&state.cwd).unwrap_or(path).display()
        );
        invalidated.extend(state.graph.invalidate_file(path));
    }

    if let Some(plugin) = &state.plugin {
        if !invalidated.is_empty() {
            let _ = state.hmr_tx.send(plugin.handle_hot_update(&invalidated));
        }
    }
    let _ = state.hmr_tx.send(HmrMessage::Reload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_ignore() {
        assert!(should_ignore(Path::new("/p/node_modules/x/index.js")));
        assert!(should_ignore(Path::new("/p/.git/HEAD")));
        assert!(should_ignore(Path::new("/p/src/.hidden.js")));
        assert!(!should_ignore(Path::new("/p/src/main.js")));
    }

    #[test]
    fn test_is_watched() {
        assert!(is_watched(Path::new("/p/src/main.js")));
        assert!(is_watched(Path::new("/p/index.html")));
        assert!(!is_watched(Path::new("/p/src/notes.txt")));
    }

    #[test]
    fn test_socket_close_ends_loop() {
        assert_eq!(classify_incoming(None), Incoming::Closed);
        assert_eq!(classify_incoming(Some(Ok(Message::Close(None)))), Incoming::Closed);
        assert_eq!(
            classify_incoming(Some(Err(axum::Error::new(std::io::Error::other("reset"))))),
            Incoming::Closed
        );
        assert_eq!(classify_incoming(Some(Ok(Message::Ping(vec![1])))), Incoming::Ignored);
        assert_eq!(
            classify_incoming(Some(Ok(Message::Text("{}".to_string())))),
            Incoming::Frame("{}".to_string())
        );
    }

    #[test]
    fn test_debouncer_waits_for_quiet_period() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(DEBOUNCE);
        assert_eq!(debouncer.wait_time(t0), None);

        debouncer.push(vec![PathBuf::from("/p/src/a.js")], t0);
        assert_eq!(debouncer.take_due(t0 + Duration::from_millis(10)), None);

        debouncer.push(vec![PathBuf::from("/p/src/b.js")], t0 + Duration::from_millis(10));
        assert_eq!(
            debouncer.wait_time(t0 + Duration::from_millis(30)),
            Some(Duration::from_millis(30))
        );
        assert_eq!(debouncer.take_due(t0 + Duration::from_millis(30)), None);

        assert_eq!(
            debouncer.take_due(t0 + Duration::from_millis(60)),
            Some(vec![PathBuf::from("/p/src/a.js"), PathBuf::from("/p/src/b.js")])
        );
        assert_eq!(debouncer.wait_time(t0 + Duration::from_millis(60)), None);
    }

    #[test]
    fn test_debouncer_flushes_trailing_change() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(DEBOUNCE);

        debouncer.push(vec![PathBuf::from("/p/src/a.js")], t0);
        assert_eq!(
            debouncer.take_due(t0 + DEBOUNCE),
            Some(vec![PathBuf::from("/p/src/a.js")])
        );

        // A change right after a flush with nothing following it.
        let t1 = t0 + DEBOUNCE + Duration::from_millis(10);
        debouncer.push(vec![PathBuf::from("/p/src/b.js")], t1);
        assert_eq!(debouncer.wait_time(t1), Some(DEBOUNCE));
        assert_eq!(
            debouncer.take_due(t1 + DEBOUNCE),
            Some(vec![PathBuf::from("/p/src/b.js")])
        );
    }

    #[test]
    fn test_debouncer_ignores_unwatched_paths() {
        let t0 = Instant::now();
        let mut debouncer = Debouncer::new(DEBOUNCE);
        debouncer.push(
            vec![PathBuf::from("/p/node_modules/x/index.js"), PathBuf::from("/p/notes.txt")],
            t0,
        );
        assert_eq!(debouncer.wait_time(t0), None);
        assert_eq!(debouncer.take_due(t0 + DEBOUNCE), None);
    }

    #[test]
    fn test_generated_index_imports_entry() {
        let html = generate_index_html("/src/main.js", "<script src=\"/@hmr-client\"></script>", true);
        assert!(html.contains("System.import('/src/main.js')"));

        let plain = generate_index_html("/src/main.js", "", false);
        assert!(plain.contains(r#"<script type="module" src="/src/main.js"></script>"#));
    }

    #[test]
    fn test_user_index_gets_hmr_client() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("index.html"),
            "<html><head></head><body></body></html>",
        )
        .unwrap();

        let html = load_index_html(dir.path(), "/src/main.js", true);
        let script = html.find(r#"<script type="module" src="/@hmr-client">"#).unwrap();
        assert!(script < html.find("</head>").unwrap());
        assert!(!html.contains("System.import"));
    }

    #[test]
    fn test_file_change_announces_then_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let options = PluginOptions {
            workers: Some(1),
            ..PluginOptions::default()
        };
        let assets = ClientAssets::from_loader_source("var System = {};", &options);
        let plugin = CoalescePlugin::new(options, assets).unwrap();

        let graph = Arc::new(MemoryModuleGraph::new());
        let file = dir.path().join("src/a.js");
        graph.ensure_module("a", "/src/a.js", Some(file.clone()));
        graph.set_transform_result("a", coalesce_core::TransformResult::code("a();"));

        let (hmr_tx, mut rx) = broadcast::channel(16);
        let state = DevState {
            hmr_tx,
            cwd: dir.path().to_path_buf(),
            port: 0,
            graph: graph.clone(),
            plugin: Some(plugin),
            base_html: String::new(),
        };

        handle_file_change(&state, vec![file]);

        assert_eq!(
            rx.try_recv().unwrap(),
            HmrMessage::invalidate_modules(vec!["/src/a.js".to_string()])
        );
        assert_eq!(rx.try_recv().unwrap(), HmrMessage::Reload);

        let record = graph.module_by_url("/src/a.js").unwrap();
        assert!(record.transform_result.is_none());
        assert_eq!(record.cached_result().unwrap().code, "a();");
        assert_eq!(
            state.plugin.as_ref().unwrap().cache().invalidated_urls(),
            vec!["/src/a.js"]
        );
    }
}
