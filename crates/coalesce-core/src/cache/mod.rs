//! Cache version controller.
//!
//! Single source of truth for which bundle generation is authoritative and
//! which module URLs are known to be stale. Regeneration is lazy: bumping
//! the version only marks the cached bundle stale, and the next bundle
//! request rebuilds it.
//!
//! The version, the bundle and the pending source map build are kept under
//! one lock and swapped together, so a bundle and a source map from two
//! different versions are never handed out as a pair.

pub mod bundle;
pub mod sourcemap;
mod version;

pub use bundle::{generate_bundle, GeneratedBundle, CODE_INTERVAL_FLAG};
pub use sourcemap::{build_index_map, SectionSourceMap};
pub use version::CacheVersion;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{error, info};

use crate::config::PluginOptions;
use crate::graph::{ready_modules, ModuleGraph};

type SourceMapFuture = Shared<BoxFuture<'static, Arc<str>>>;

struct CacheState {
    required_version: CacheVersion,
    invalidated: HashSet<String>,
    bundle: Option<GeneratedBundle>,
    source_map: Option<SourceMapFuture>,
}

/// Owns the cache version, the invalidated URL set and the generated bundle.
pub struct CacheController {
    options: Arc<PluginOptions>,
    state: Mutex<CacheState>,
}

impl CacheController {
    /// Create a controller stamped with a fresh startup version.
    #[must_use]
    pub fn new(options: Arc<PluginOptions>) -> Self {
        Self {
            options,
            state: Mutex::new(CacheState {
                required_version: CacheVersion::now(),
                invalidated: HashSet::new(),
                bundle: None,
                source_map: None,
            }),
        }
    }

    /// The currently authoritative version.
    pub fn version(&self) -> CacheVersion {
        self.state.lock().unwrap().required_version
    }

    /// Mark module URLs stale. Does not bump the version, so a burst of file
    /// edits coalesces into one refresh.
    pub fn invalidate<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock().unwrap();
        state.invalidated.extend(urls.into_iter().map(Into::into));
    }

    /// Sorted snapshot of the invalidated URL set.
    pub fn invalidated_urls(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut urls: Vec<String> = state.invalidated.iter().cloned().collect();
        urls.sort();
        urls
    }

    /// Bump the version and clear the invalidated set in one step.
    pub fn request_update(&self) -> CacheVersion {
        let mut state = self.state.lock().unwrap();
        state.required_version = state.required_version.next();
        state.invalidated.clear();
        state.required_version
    }

    /// Bundle for the current version, regenerated if stale.
    ///
    /// Returns the same allocation for repeated calls within one version.
    pub fn get_bundle(&self, graph: Arc<dyn ModuleGraph>) -> GeneratedBundle {
        let mut state = self.state.lock().unwrap();
        let version = state.required_version;

        if let Some(bundle) = state.bundle.as_ref().filter(|b| b.version == version) {
            return bundle.clone();
        }

        let start = Instant::now();
        let modules = ready_modules(graph.as_ref(), &self.options);
        let bundle = generate_bundle(&modules, &self.options.source_map_url, version);
        info!(
            modules = bundle.module_count,
            version = %version,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Generated code map for {} modules within {}ms, subsequent reloads save {} requests",
            bundle.module_count,
            start.elapsed().as_millis(),
            bundle.module_count,
        );

        state.source_map = Some(source_map_task(bundle.code.clone(), graph));
        state.bundle = Some(bundle.clone());
        bundle
    }

    /// Index source map for the most recently generated bundle.
    ///
    /// Every caller for one generation awaits the same build. Before any
    /// bundle has been generated this is an empty index map.
    pub async fn source_map(&self) -> Arc<str> {
        let pending = self.state.lock().unwrap().source_map.clone();
        match pending {
            Some(pending) => pending.await,
            None => empty_source_map(),
        }
    }
}

fn source_map_task(code: Arc<str>, graph: Arc<dyn ModuleGraph>) -> SourceMapFuture {
    async move {
        let built = tokio::task::spawn_blocking(move || {
            sourcemap::generate_source_map(&code, graph.as_ref())
        })
        .await;

        match built {
            Ok(Ok(json)) => Arc::from(json),
            Ok(Err(e)) => {
                error!(error = %e, "failed to serialize source map");
                empty_source_map()
            }
            Err(e) => {
                error!(error = %e, "source map generation failed");
                empty_source_map()
            }
        }
    }
    .boxed()
    .shared()
}

fn empty_source_map() -> Arc<str> {
    Arc::from(r#"{"version":3,"sections":[]}"#)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{MemoryModuleGraph, ModuleRecord, TransformResult};
    use serde_json::json;

    fn controller() -> CacheController {
        CacheController::new(Arc::new(PluginOptions::default()))
    }

    fn graph() -> Arc<MemoryModuleGraph> {
        let graph = MemoryModuleGraph::new();
        graph.insert(
            ModuleRecord::new("/p/src/a.js", "/src/a.js").with_transform_result(
                TransformResult::code("a();").with_map(json!({"version": 3, "sources": ["a"], "mappings": "AAAA"})),
            ),
        );
        graph.insert(
            ModuleRecord::new("/p/src/b.js", "/src/b.js")
                .with_transform_result(TransformResult::code("b();")),
        );
        Arc::new(graph)
    }

    #[test]
    fn test_get_bundle_is_memoized() {
        let cache = controller();
        let graph = graph();

        let first = cache.get_bundle(graph.clone());
        graph.insert(
            ModuleRecord::new("/p/src/c.js", "/src/c.js")
                .with_transform_result(TransformResult::code("c();")),
        );
        let second = cache.get_bundle(graph);

        assert!(Arc::ptr_eq(&first.code, &second.code));
        assert_eq!(second.module_count, 2);
    }

    #[test]
    fn test_invalidate_does_not_bump_version() {
        let cache = controller();
        let graph = graph();
        let version = cache.version();

        let first = cache.get_bundle(graph.clone());
        cache.invalidate(["/src/b.js", "/src/a.js"]);
        let second = cache.get_bundle(graph);

        assert_eq!(cache.version(), version);
        assert!(Arc::ptr_eq(&first.code, &second.code));
        assert_eq!(cache.invalidated_urls(), vec!["/src/a.js", "/src/b.js"]);
    }

    #[test]
    fn test_request_update_bumps_and_clears() {
        let cache = controller();
        let graph = graph();

        let first = cache.get_bundle(graph.clone());
        cache.invalidate(["/src/a.js"]);
        let version = cache.request_update();

        assert!(version > first.version);
        assert!(cache.invalidated_urls().is_empty());

        let second = cache.get_bundle(graph);
        assert!(!Arc::ptr_eq(&first.code, &second.code));
        assert_eq!(second.version, version);
        assert!(second.code.contains(&format!("?v={version}")));
    }

    #[tokio::test]
    async fn test_source_map_follows_bundle() {
        let cache = controller();
        assert_eq!(&*cache.source_map().await, r#"{"version":3,"sections":[]}"#);

        cache.get_bundle(graph());
        let map: serde_json::Value = serde_json::from_str(&cache.source_map().await).unwrap();
        let sections = map["sections"].as_array().unwrap();
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0]["map"]["sources"], json!(["/src/a.js"]));
        // Line 1 is the version stamp, line 2 opens the map, line 3 is a's flag.
        assert_eq!(sections[0]["offset"]["line"], json!(3));
    }

    #[tokio::test]
    async fn test_source_map_is_shared_within_a_version() {
        let cache = controller();
        cache.get_bundle(graph());

        let (a, b) = tokio::join!(cache.source_map(), cache.source_map());
        assert!(Arc::ptr_eq(&a, &b));
    }
}
