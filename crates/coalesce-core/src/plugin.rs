//! Host-facing facade.
//!
//! A host wires [`CoalescePlugin`] into its server: virtual routes for the
//! bundle and its source map, index HTML injection, the hot-update hook, the
//! client event hook and the post-transform hook.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::cache::{CacheController, CacheVersion};
use crate::client::ClientAssets;
use crate::config::PluginOptions;
use crate::error::Error;
use crate::graph::{ModuleGraph, ModuleRecord, TransformResult};
use crate::hmr::{HmrMessage, INVALIDATED_URLS_GLOBAL, UPDATE_MODULES_EVENT};
use crate::transform::{ModuleConverter, SystemConverter, TransformPool};
use crate::url::path_of;

/// The two routes the plugin answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualRoute {
    Bundle,
    SourceMap,
}

/// Body and headers for a virtual route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualResponse {
    pub body: Arc<str>,
    pub content_type: &'static str,
    pub cache_control: String,
}

/// Cached module bundles for one dev server.
pub struct CoalescePlugin {
    options: Arc<PluginOptions>,
    cache: CacheController,
    pool: TransformPool,
    assets: ClientAssets,
}

impl CoalescePlugin {
    /// Plugin converting modules with [`SystemConverter`].
    pub fn new(options: PluginOptions, assets: ClientAssets) -> Result<Self, Error> {
        Self::with_converter(options, assets, Arc::new(SystemConverter::new()))
    }

    pub fn with_converter(
        options: PluginOptions,
        assets: ClientAssets,
        converter: Arc<dyn ModuleConverter>,
    ) -> Result<Self, Error> {
        let options = Arc::new(options);
        let pool = TransformPool::new(converter, options.workers)?;
        info!(workers = pool.workers(), "transform pool started");
        Ok(Self {
            cache: CacheController::new(Arc::clone(&options)),
            options,
            pool,
            assets,
        })
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    pub fn cache(&self) -> &CacheController {
        &self.cache
    }

    /// Which virtual route `path` names, ignoring its query.
    pub fn route(&self, path: &str) -> Option<VirtualRoute> {
        let path = path_of(path);
        if path == self.options.bundle_url {
            Some(VirtualRoute::Bundle)
        } else if path == self.options.source_map_url {
            Some(VirtualRoute::SourceMap)
        } else {
            None
        }
    }

    pub fn serve_bundle(&self, graph: Arc<dyn ModuleGraph>) -> VirtualResponse {
        let bundle = self.cache.get_bundle(graph);
        VirtualResponse {
            body: bundle.code,
            content_type: "application/javascript",
            cache_control: self.options.cache_control.clone(),
        }
    }

    pub async fn serve_source_map(&self) -> VirtualResponse {
        VirtualResponse {
            body: self.cache.source_map().await,
            content_type: "application/json",
            cache_control: self.options.cache_control.clone(),
        }
    }

    /// Inject the loader, the bundle script and the invalidated URL snapshot.
    pub fn transform_index_html(&self, html: &str) -> String {
        let version = self.cache.version();
        let invalidated = serde_json::to_string(&self.cache.invalidated_urls())
            .unwrap_or_else(|_| "[]".to_string());

        let tags = format!(
            "<script>{}</script>\n<script async src=\"{}?v={version}\"></script>\n<script>window.{INVALIDATED_URLS_GLOBAL} = new Set({});</script>\n",
            escape_inline_script(&self.assets.script()),
            self.options.bundle_url,
            escape_inline_script(&invalidated),
        );

        inject_tags(html, &tags)
    }

    /// Mark the changed modules stale. Returns the event to broadcast.
    pub fn handle_hot_update(&self, modules: &[Arc<ModuleRecord>]) -> HmrMessage {
        let urls: Vec<String> = modules.iter().map(|m| m.url.clone()).collect();
        debug!(count = urls.len(), "invalidating modules");
        self.cache.invalidate(urls.iter().cloned());
        HmrMessage::invalidate_modules(urls)
    }

    /// Handle a custom event from the client. Returns the new version when
    /// the event requested a cache update.
    pub fn on_client_event(&self, event: &str) -> Option<CacheVersion> {
        if event != UPDATE_MODULES_EVENT {
            return None;
        }
        info!("The next reload will update the cache.");
        Some(self.cache.request_update())
    }

    /// Post-transform hook: convert module `id` to loader format.
    ///
    /// Never fails. A module the graph does not know is served unchanged.
    pub async fn transform(&self, code: String, id: &str, graph: &dyn ModuleGraph) -> TransformResult {
        let Some(url) = graph.module_by_id(id).map(|m| m.url.clone()) else {
            error!(module = %id, "transform error: module url not found");
            return TransformResult::passthrough(code);
        };

        let mut result = self.pool.transform(code, id.to_string(), url).await;

        if self.options.is_worker_entry(id) {
            let script = self.assets.script();
            let prefix = script.trim_end();
            let prefix_lines = prefix.lines().count() as u32;
            result.code = format!("{prefix}\n{}", result.code);
            result.map = result
                .map
                .map(|map| Arc::new(shift_map_lines(&map, prefix_lines)));
        }
        result
    }
}

/// Keep inline script content from closing its own tag.
fn escape_inline_script(script: &str) -> String {
    script.replace("</script", "<\\/script")
}

fn inject_tags(html: &str, tags: &str) -> String {
    for anchor in ["</head>", "</body>"] {
        if let Some(pos) = html.find(anchor) {
            let mut out = String::with_capacity(html.len() + tags.len());
            out.push_str(&html[..pos]);
            out.push_str(tags);
            out.push_str(&html[pos..]);
            return out;
        }
    }
    format!("{html}{tags}")
}

/// Push every mapping of a V3 map down by `lines` generated lines.
fn shift_map_lines(map: &serde_json::Value, lines: u32) -> serde_json::Value {
    let mut shifted = map.clone();
    if let Some(mappings) = map.get("mappings").and_then(serde_json::Value::as_str) {
        shifted["mappings"] = serde_json::Value::String(format!("{}{mappings}", ";".repeat(lines as usize)));
    }
    shifted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryModuleGraph;
    use crate::transform::{ConvertError, ConvertedModule};
    use serde_json::json;

    struct UpperConverter;

    impl ModuleConverter for UpperConverter {
        fn name(&self) -> &'static str {
            "upper"
        }

        fn convert(&self, source: &str, _id: &str, name: &str) -> Result<ConvertedModule, ConvertError> {
            Ok(ConvertedModule {
                code: format!("/* {name} */ {}", source.to_uppercase()),
                map: Some(json!({"version": 3, "sources": [name], "mappings": "AAAA"})),
            })
        }
    }

    fn plugin() -> CoalescePlugin {
        let options = PluginOptions {
            workers: Some(1),
            ..PluginOptions::default()
        };
        let assets = ClientAssets::from_loader_source("var System = {};", &options);
        CoalescePlugin::with_converter(options, assets, Arc::new(UpperConverter)).unwrap()
    }

    fn graph() -> Arc<MemoryModuleGraph> {
        let graph = MemoryModuleGraph::new();
        graph.insert(
            ModuleRecord::new("/p/src/a.js", "/src/a.js").with_transform_result(TransformResult::code("a();")),
        );
        graph.ensure_module("/p/src/w.js?worker_file", "/src/w.js?worker_file", None);
        Arc::new(graph)
    }

    #[test]
    fn test_route_ignores_query() {
        let plugin = plugin();
        assert_eq!(plugin.route("/@coalesce/modules.js?v=123"), Some(VirtualRoute::Bundle));
        assert_eq!(plugin.route("/@coalesce/modules.js.map?v=123"), Some(VirtualRoute::SourceMap));
        assert_eq!(plugin.route("/src/a.js"), None);
    }

    #[tokio::test]
    async fn test_serve_bundle_and_map() {
        let plugin = plugin();
        let bundle = plugin.serve_bundle(graph());
        assert_eq!(bundle.content_type, "application/javascript");
        assert_eq!(bundle.cache_control, "max-age=3600, immutable");
        assert!(bundle.body.contains(r#"["/src/a.js", { code: () => {"#));
        assert!(!bundle.body.contains("worker_file"));

        let map = plugin.serve_source_map().await;
        assert_eq!(map.content_type, "application/json");
        let parsed: serde_json::Value = serde_json::from_str(&map.body).unwrap();
        assert_eq!(parsed["version"], 3);
    }

    #[test]
    fn test_index_html_injection() {
        let plugin = plugin();
        plugin.cache().invalidate(["/src/b.js"]);
        let html = plugin.transform_index_html("<html><head><title>x</title></head><body></body></html>");

        let loader = html.find("<script>var System = {};").unwrap();
        let bundle = html
            .find(&format!(r#"<script async src="/@coalesce/modules.js?v={}">"#, plugin.cache().version()))
            .unwrap();
        let seed = html
            .find(r#"window.__COALESCE_INVALIDATED_URLS__ = new Set(["/src/b.js"]);"#)
            .unwrap();
        let head_end = html.find("</head>").unwrap();
        assert!(loader < bundle && bundle < seed && seed < head_end);
    }

    #[test]
    fn test_index_html_without_head() {
        let plugin = plugin();
        let html = plugin.transform_index_html("<body><div></div></body>");
        assert!(html.find("new Set([])").unwrap() < html.find("</body>").unwrap());

        let bare = plugin.transform_index_html("<div></div>");
        assert!(bare.starts_with("<div></div><script>"));
    }

    #[test]
    fn test_hot_update_invalidates_and_announces() {
        let plugin = plugin();
        let graph = graph();
        let version = plugin.cache().version();
        let modules = vec![graph.module_by_url("/src/a.js").unwrap()];

        let msg = plugin.handle_hot_update(&modules);
        assert_eq!(msg, HmrMessage::invalidate_modules(vec!["/src/a.js".to_string()]));
        assert_eq!(plugin.cache().invalidated_urls(), vec!["/src/a.js"]);
        assert_eq!(plugin.cache().version(), version);
    }

    #[test]
    fn test_update_event_bumps_version() {
        let plugin = plugin();
        let version = plugin.cache().version();
        plugin.cache().invalidate(["/src/a.js"]);

        assert_eq!(plugin.on_client_event("something-else"), None);
        let bumped = plugin.on_client_event(UPDATE_MODULES_EVENT).unwrap();
        assert!(bumped > version);
        assert!(plugin.cache().invalidated_urls().is_empty());
    }

    #[tokio::test]
    async fn test_transform_unknown_module_is_unchanged() {
        let plugin = plugin();
        let result = plugin.transform("a();".into(), "/p/missing.js", graph().as_ref()).await;
        assert_eq!(result, TransformResult::passthrough("a();"));
    }

    #[tokio::test]
    async fn test_transform_converts_by_url() {
        let plugin = plugin();
        let result = plugin.transform("a();".into(), "/p/src/a.js", graph().as_ref()).await;
        assert_eq!(result.code, "/* /src/a.js */ A();");
        assert!(result.map.is_some());
    }

    #[tokio::test]
    async fn test_worker_entry_gets_loader() {
        let plugin = plugin();
        let result = plugin
            .transform("w();".into(), "/p/src/w.js?worker_file", graph().as_ref())
            .await;
        assert!(result.code.starts_with("var System = {};\n"));
        assert!(result.code.ends_with("/* /src/w.js?worker_file */ W();"));

        let map = result.map.unwrap();
        let mappings = map["mappings"].as_str().unwrap();
        let offset = result.code.lines().count() - 1;
        assert_eq!(mappings, format!("{}AAAA", ";".repeat(offset)));
    }
}
