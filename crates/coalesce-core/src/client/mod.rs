//! Client-side module loader extension.
//!
//! Wraps a SystemJS-style loader and decides, per instantiation, whether to
//! replay a module from the cached bundle, fetch it over the network, or
//! auto-execute a script that registered itself without being imported.
//! [`runtime`] carries the same state machine as browser JavaScript.

pub mod runtime;
mod session;

pub use runtime::ClientAssets;
pub use session::{LoaderSession, UpdateNotifier};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;

use crate::cache::CacheVersion;
use crate::config::PluginOptions;
use crate::url::{extension_candidates, has_extension, normalize_url};

/// A failed network import.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("failed to evaluate {url}: {message}")]
    Evaluate { url: String, message: String },
}

/// The hooks of the wrapped module loader.
pub trait ModuleLoader: Send + Sync {
    /// What a module's `register` call hands the loader.
    type Registration: Clone + Send + Sync + 'static;

    /// Resolve `specifier` against `parent`.
    fn resolve(&self, specifier: &str, parent: Option<&str>) -> String;

    /// Whether the registry already knows `id`.
    fn has(&self, id: &str) -> bool;

    /// Record a registration made while `name` was being loaded.
    fn register(&self, name: &str, registration: Self::Registration);

    /// The registration recorded for `url`, if any.
    fn get_register(&self, url: &str) -> Option<Self::Registration>;

    /// Fetch and evaluate `url` over the network.
    fn import(&self, url: &str) -> BoxFuture<'_, Result<(), LoaderError>>;

    /// Import `name` with a registration that is already in hand.
    fn auto_import(&self, name: &str, registration: Self::Registration);
}

/// Target of the `register` call a cached thunk makes when replayed.
pub trait Registrar<R> {
    fn register(&self, name: &str, registration: R) -> Option<R>;
}

/// One module of the cached bundle: replaying it re-runs its `register` call.
pub type CachedModule<R> = Arc<dyn Fn(&dyn Registrar<R>) + Send + Sync>;

struct InstalledCache<R> {
    version: CacheVersion,
    modules: HashMap<String, CachedModule<R>>,
}

/// Tunables of the extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionConfig {
    pub max_uncached_modules: usize,
    pub extensions: Vec<String>,
    pub external_dir: String,
    /// Running inside a background worker: the cache is never consulted.
    pub in_worker: bool,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self::from(&PluginOptions::default())
    }
}

impl From<&PluginOptions> for ExtensionConfig {
    fn from(options: &PluginOptions) -> Self {
        Self {
            max_uncached_modules: options.max_uncached_modules,
            extensions: options.extensions.clone(),
            external_dir: options.external_dir.clone(),
            in_worker: false,
        }
    }
}

/// Loader wrapper composing cache replay and miss tracking around
/// `resolve`, `register` and `instantiate`.
pub struct LoaderExtension<L: ModuleLoader> {
    inner: L,
    config: ExtensionConfig,
    session: Arc<LoaderSession>,
    cache: RwLock<Option<InstalledCache<L::Registration>>>,
    /// Serializes replays.
    replay_lock: Mutex<()>,
}

impl<L: ModuleLoader> LoaderExtension<L> {
    pub fn new(inner: L, config: ExtensionConfig) -> Self {
        Self::with_session(inner, config, Arc::new(LoaderSession::new()))
    }

    pub fn with_session(inner: L, config: ExtensionConfig, session: Arc<LoaderSession>) -> Self {
        Self {
            inner,
            config,
            session,
            cache: RwLock::new(None),
            replay_lock: Mutex::new(()),
        }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn session(&self) -> &Arc<LoaderSession> {
        &self.session
    }

    /// Install the cached bundle of `version`. A different version than the
    /// installed one re-arms the miss threshold.
    pub fn install_cache(&self, version: CacheVersion, modules: HashMap<String, CachedModule<L::Registration>>) {
        let mut cache = self.cache.write().unwrap();
        if cache.as_ref().map(|c| c.version) != Some(version) {
            self.session.reset();
        }
        debug!(version = %version, modules = modules.len(), "installed module cache");
        *cache = Some(InstalledCache { version, modules });
    }

    /// Version of the installed cache.
    pub fn cache_version(&self) -> Option<CacheVersion> {
        self.cache.read().unwrap().as_ref().map(|c| c.version)
    }

    pub fn seed_invalidated<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.session.seed_invalidated(urls);
    }

    pub fn mark_invalidated<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.session.mark_invalidated(urls);
    }

    pub fn set_update_notifier(&self, notifier: UpdateNotifier) {
        self.session.set_update_notifier(notifier);
    }

    /// Resolve, probing the registry for an extension when the resolved id
    /// has none.
    pub fn resolve(&self, specifier: &str, parent: Option<&str>) -> String {
        let resolved = self.inner.resolve(specifier, parent);
        if has_extension(&resolved) {
            return resolved;
        }
        self.config
            .extensions
            .iter()
            .map(|ext| format!("{resolved}.{ext}"))
            .find(|candidate| self.inner.has(candidate))
            .unwrap_or(resolved)
    }

    /// Handle a `register` call.
    ///
    /// During a cached replay the registration goes back to the replaying
    /// caller. A root-relative script that was not imported through the
    /// extension is auto-imported; anything else is recorded by the loader.
    pub fn register(&self, name: &str, registration: L::Registration) -> Option<L::Registration> {
        if self.session.is_replaying() {
            return Some(registration);
        }
        if !self.session.is_explicit(name) && name.starts_with('/') {
            self.inner.auto_import(name, registration);
        } else {
            self.inner.register(name, registration);
        }
        None
    }

    /// Produce the registration for `url`.
    pub async fn instantiate(
        &self,
        url: &str,
        preloaded: Option<L::Registration>,
    ) -> Result<Option<L::Registration>, LoaderError> {
        if let Some(registration) = preloaded {
            return Ok(Some(registration));
        }

        let path = normalize_url(url);

        if !self.config.in_worker && !self.session.is_invalidated(&path) {
            if let Some(module) = self.cached_module(&path) {
                return Ok(self.replay(&module));
            }
        }

        let has_cache = self.cache.read().unwrap().is_some();
        if !self.config.in_worker && has_cache && !path.contains(&self.config.external_dir) {
            self.session.record_miss();
        }
        if self.session.maybe_notify(self.config.max_uncached_modules) {
            debug!(misses = self.session.miss_count(), "requested cache update");
        }

        let candidates = extension_candidates(&path, &self.config.extensions);
        self.session.mark_explicit(&candidates);
        let imported = self.inner.import(url).await;
        self.session.unmark_explicit(&candidates);
        imported?;

        Ok(self.inner.get_register(url))
    }

    fn cached_module(&self, path: &str) -> Option<CachedModule<L::Registration>> {
        self.cache
            .read()
            .unwrap()
            .as_ref()
            .and_then(|cache| cache.modules.get(path).cloned())
    }

    fn replay(&self, module: &CachedModule<L::Registration>) -> Option<L::Registration> {
        let _serial = self.replay_lock.lock().unwrap();
        let slot = Mutex::new(None);
        let registrar: &dyn Registrar<L::Registration> = &SlotRegistrar {
            extension: self,
            slot: &slot,
        };
        {
            let _guard = self.session.begin_replay();
            (**module)(registrar);
        }
        slot.into_inner().unwrap()
    }
}

/// Registrar handed to a replayed thunk; captures what it registers.
struct SlotRegistrar<'a, L: ModuleLoader> {
    extension: &'a LoaderExtension<L>,
    slot: &'a Mutex<Option<L::Registration>>,
}

impl<L: ModuleLoader> Registrar<L::Registration> for SlotRegistrar<'_, L> {
    fn register(&self, name: &str, registration: L::Registration) -> Option<L::Registration> {
        let captured = self.extension.register(name, registration)?;
        *self.slot.lock().unwrap() = Some(captured.clone());
        Some(captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockLoader {
        known: HashSet<String>,
        failing: HashSet<String>,
        registry: Mutex<HashMap<String, String>>,
        imports: Mutex<Vec<String>>,
        auto_imports: Mutex<Vec<String>>,
        /// Whether each imported URL was marked explicit while importing.
        explicit_during_import: Mutex<Vec<bool>>,
        session: Option<Arc<LoaderSession>>,
    }

    impl ModuleLoader for MockLoader {
        type Registration = String;

        fn resolve(&self, specifier: &str, _parent: Option<&str>) -> String {
            specifier.to_string()
        }

        fn has(&self, id: &str) -> bool {
            self.known.contains(id)
        }

        fn register(&self, name: &str, registration: String) {
            self.registry.lock().unwrap().insert(name.to_string(), registration);
        }

        fn get_register(&self, url: &str) -> Option<String> {
            self.registry.lock().unwrap().get(url).cloned()
        }

        fn import(&self, url: &str) -> BoxFuture<'_, Result<(), LoaderError>> {
            let url = url.to_string();
            async move {
                self.imports.lock().unwrap().push(url.clone());
                if let Some(session) = &self.session {
                    self.explicit_during_import
                        .lock()
                        .unwrap()
                        .push(session.is_explicit(&normalize_url(&url)));
                }
                if self.failing.contains(&url) {
                    return Err(LoaderError::Fetch {
                        url,
                        message: "404".to_string(),
                    });
                }
                self.registry
                    .lock()
                    .unwrap()
                    .insert(url.clone(), format!("network:{url}"));
                Ok(())
            }
            .boxed()
        }

        fn auto_import(&self, name: &str, _registration: String) {
            self.auto_imports.lock().unwrap().push(name.to_string());
        }
    }

    fn config(max: usize) -> ExtensionConfig {
        ExtensionConfig {
            max_uncached_modules: max,
            ..ExtensionConfig::default()
        }
    }

    fn thunk(name: &'static str) -> CachedModule<String> {
        Arc::new(move |registrar: &dyn Registrar<String>| {
            registrar.register(name, format!("cached:{name}"));
        })
    }

    fn cache(urls: &[&'static str]) -> HashMap<String, CachedModule<String>> {
        urls.iter().map(|url| ((*url).to_string(), thunk(url))).collect()
    }

    #[test]
    fn test_resolve_probes_extensions() {
        let loader = MockLoader {
            known: ["/src/app.ts".to_string()].into_iter().collect(),
            ..MockLoader::default()
        };
        let ext = LoaderExtension::new(loader, ExtensionConfig::default());

        assert_eq!(ext.resolve("/src/app", None), "/src/app.ts");
        assert_eq!(ext.resolve("/src/other", None), "/src/other");
        assert_eq!(ext.resolve("/src/app.js", None), "/src/app.js");
    }

    #[test]
    fn test_register_routes() {
        let ext = LoaderExtension::new(MockLoader::default(), ExtensionConfig::default());

        // Not imported through the extension, root-relative: auto-import.
        assert_eq!(ext.register("/src/script.js", "r".into()), None);
        assert_eq!(*ext.inner().auto_imports.lock().unwrap(), vec!["/src/script.js"]);

        // Bare names go to the loader.
        ext.register("lib", "r".into());
        assert_eq!(ext.inner().get_register("lib").as_deref(), Some("r"));

        // Explicit imports go to the loader.
        ext.session().mark_explicit(&["/src/a.js".to_string()]);
        ext.register("/src/a.js", "a".into());
        assert_eq!(ext.inner().get_register("/src/a.js").as_deref(), Some("a"));
        assert_eq!(ext.inner().auto_imports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_preloaded_registration_wins() {
        let ext = LoaderExtension::new(MockLoader::default(), ExtensionConfig::default());
        let got = ext.instantiate("/src/a.js", Some("pre".into())).await.unwrap();
        assert_eq!(got.as_deref(), Some("pre"));
        assert!(ext.inner().imports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cached_module_is_replayed() {
        let ext = LoaderExtension::new(MockLoader::default(), config(20));
        ext.install_cache(CacheVersion::from(1), cache(&["/src/a.js"]));

        let got = ext
            .instantiate("http://localhost:3000/src/a.js?t=1700000000000&import", None)
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("cached:/src/a.js"));
        assert!(ext.inner().imports.lock().unwrap().is_empty());
        assert!(!ext.session().is_replaying());
        // Replay never reaches the loader's registry.
        assert!(ext.inner().registry.lock().unwrap().is_empty());
        assert_eq!(ext.session().miss_count(), 0);
    }

    #[tokio::test]
    async fn test_invalidated_url_goes_to_network() {
        let ext = LoaderExtension::new(MockLoader::default(), config(20));
        ext.install_cache(CacheVersion::from(1), cache(&["/src/a.js"]));
        ext.seed_invalidated(["/src/a.js"]);

        let got = ext.instantiate("/src/a.js", None).await.unwrap();
        assert_eq!(got.as_deref(), Some("network:/src/a.js"));
        assert_eq!(*ext.inner().imports.lock().unwrap(), vec!["/src/a.js"]);
        assert_eq!(ext.session().miss_count(), 1);
    }

    #[tokio::test]
    async fn test_worker_never_uses_cache() {
        let ext = LoaderExtension::new(
            MockLoader::default(),
            ExtensionConfig {
                in_worker: true,
                ..config(0)
            },
        );
        ext.install_cache(CacheVersion::from(1), cache(&["/src/a.js"]));

        let got = ext.instantiate("/src/a.js", None).await.unwrap();
        assert_eq!(got.as_deref(), Some("network:/src/a.js"));
        assert_eq!(ext.session().miss_count(), 0);
    }

    #[tokio::test]
    async fn test_misses_only_counted_with_cache_outside_external_dir() {
        let ext = LoaderExtension::new(MockLoader::default(), config(20));
        ext.instantiate("/src/a.js", None).await.unwrap();
        assert_eq!(ext.session().miss_count(), 0);

        ext.install_cache(CacheVersion::from(1), HashMap::new());
        ext.instantiate("/node_modules/react/index.js", None).await.unwrap();
        assert_eq!(ext.session().miss_count(), 0);
        ext.instantiate("/src/a.js", None).await.unwrap();
        assert_eq!(ext.session().miss_count(), 1);
    }

    #[tokio::test]
    async fn test_threshold_notifies_once_and_rearms() {
        let ext = LoaderExtension::new(MockLoader::default(), config(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        ext.set_update_notifier(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        ext.install_cache(CacheVersion::from(1), HashMap::new());

        for i in 0..2 {
            ext.instantiate(&format!("/src/m{i}.js"), None).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        ext.instantiate("/src/m2.js", None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for i in 3..6 {
            ext.instantiate(&format!("/src/m{i}.js"), None).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Same version: no reset.
        ext.install_cache(CacheVersion::from(1), HashMap::new());
        assert!(ext.session().notified());

        ext.install_cache(CacheVersion::from(2), HashMap::new());
        assert_eq!(ext.session().miss_count(), 0);
        for i in 0..3 {
            ext.instantiate(&format!("/src/n{i}.js"), None).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_candidates_marked_during_import_and_cleared_on_error() {
        let session = Arc::new(LoaderSession::new());
        let loader = MockLoader {
            failing: ["/src/broken".to_string()].into_iter().collect(),
            session: Some(session.clone()),
            ..MockLoader::default()
        };
        let ext = LoaderExtension::with_session(loader, ExtensionConfig::default(), session);

        ext.instantiate("/src/a.js", None).await.unwrap();
        let err = ext.instantiate("/src/broken", None).await.unwrap_err();
        assert!(matches!(err, LoaderError::Fetch { .. }));

        assert_eq!(*ext.inner().explicit_during_import.lock().unwrap(), vec![true, true]);
        for candidate in ["/src/a.js", "/src/broken", "/src/broken.ts", "/src/broken.jsx"] {
            assert!(!ext.session().is_explicit(candidate), "{candidate} still marked");
        }
    }
}
