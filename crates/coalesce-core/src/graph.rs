//! Host module graph interface.
//!
//! The host build tool owns the module graph; this crate only reads it. A
//! record is never mutated in place: re-transforming a module replaces its
//! record with a new one.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::config::PluginOptions;

/// Transformed code and optional per-module source map.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformResult {
    /// Executable code.
    pub code: String,
    /// Source map for `code` (a V3 map object).
    pub map: Option<Arc<serde_json::Value>>,
    /// Whether `code` is in loader format. Only such code can be replayed
    /// from the bundle.
    pub converted: bool,
}

impl TransformResult {
    /// Loader-format code without a source map.
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            map: None,
            converted: true,
        }
    }

    /// Code served as-is because conversion did not happen.
    pub fn passthrough(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            map: None,
            converted: false,
        }
    }

    /// Attach a source map.
    #[must_use]
    pub fn with_map(mut self, map: serde_json::Value) -> Self {
        self.map = Some(Arc::new(map));
        self
    }
}

/// A module as known to the host.
#[derive(Debug, Clone, Default)]
pub struct ModuleRecord {
    /// Stable identifier (usually the resolved file path plus query).
    pub id: Option<String>,
    /// Browser-visible URL (path + query).
    pub url: String,
    /// File on disk backing the module.
    pub file: Option<PathBuf>,
    /// Latest transform result.
    pub transform_result: Option<TransformResult>,
    /// Result kept from before a soft invalidation. Hosts that answer
    /// not-modified requests for such modules only have the code here.
    pub invalidation_state: Option<TransformResult>,
}

impl ModuleRecord {
    /// Create a record without any transform result.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the backing file.
    #[must_use]
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Set the primary transform result.
    #[must_use]
    pub fn with_transform_result(mut self, result: TransformResult) -> Self {
        self.transform_result = Some(result);
        self
    }

    /// Set the invalidation-state fallback.
    #[must_use]
    pub fn with_invalidation_state(mut self, result: TransformResult) -> Self {
        self.invalidation_state = Some(result);
        self
    }

    /// Last good transform: the primary result, else the invalidation-state
    /// fallback when it has code.
    #[must_use]
    pub fn cached_result(&self) -> Option<&TransformResult> {
        self.transform_result.as_ref().or_else(|| {
            self.invalidation_state
                .as_ref()
                .filter(|state| !state.code.is_empty())
        })
    }
}

/// Read access to the host's module graph.
pub trait ModuleGraph: Send + Sync {
    /// Every module currently in the graph.
    fn modules(&self) -> Vec<Arc<ModuleRecord>>;

    /// Look up a module by identifier.
    fn module_by_id(&self, id: &str) -> Option<Arc<ModuleRecord>>;
}

/// Modules that may go into the cached bundle.
///
/// External dependencies and worker entries are loaded through their own
/// path and are left out.
pub fn ready_modules(graph: &dyn ModuleGraph, options: &PluginOptions) -> Vec<Arc<ModuleRecord>> {
    graph
        .modules()
        .into_iter()
        .filter(|module| !options.is_external(&module.url) && !options.is_worker_entry(&module.url))
        .collect()
}

/// In-memory module graph keyed by module id.
#[derive(Debug, Default)]
pub struct MemoryModuleGraph {
    modules: RwLock<BTreeMap<String, Arc<ModuleRecord>>>,
}

impl MemoryModuleGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module if it is not known yet. Returns the current record.
    pub fn ensure_module(&self, id: &str, url: &str, file: Option<PathBuf>) -> Arc<ModuleRecord> {
        let mut modules = self.modules.write().unwrap();
        modules
            .entry(id.to_string())
            .or_insert_with(|| {
                let mut record = ModuleRecord::new(id, url);
                record.file = file;
                Arc::new(record)
            })
            .clone()
    }

    /// Insert or replace a record. Records without an id are ignored.
    pub fn insert(&self, record: ModuleRecord) {
        if let Some(id) = record.id.clone() {
            self.modules.write().unwrap().insert(id, Arc::new(record));
        }
    }

    /// Supersede a module's record with a fresh transform result.
    ///
    /// Returns `false` when the module is unknown.
    pub fn set_transform_result(&self, id: &str, result: TransformResult) -> bool {
        let mut modules = self.modules.write().unwrap();
        let Some(current) = modules.get(id) else {
            return false;
        };
        let mut next = ModuleRecord::clone(current);
        next.transform_result = Some(result);
        next.invalidation_state = None;
        modules.insert(id.to_string(), Arc::new(next));
        true
    }

    /// Soft-invalidate every module backed by `file`.
    ///
    /// The primary transform result moves to the invalidation-state fallback.
    /// Returns the superseded records.
    pub fn invalidate_file(&self, file: &std::path::Path) -> Vec<Arc<ModuleRecord>> {
        let mut modules = self.modules.write().unwrap();
        let mut invalidated = Vec::new();

        for record in modules.values_mut() {
            if record.file.as_deref() != Some(file) {
                continue;
            }
            let mut next = ModuleRecord::clone(record);
            if let Some(result) = next.transform_result.take() {
                next.invalidation_state = Some(result);
            }
            *record = Arc::new(next);
            invalidated.push(record.clone());
        }

        invalidated
    }

    /// Look up a module by URL.
    pub fn module_by_url(&self, url: &str) -> Option<Arc<ModuleRecord>> {
        self.modules
            .read()
            .unwrap()
            .values()
            .find(|record| record.url == url)
            .cloned()
    }

    /// Number of modules in the graph.
    pub fn len(&self) -> usize {
        self.modules.read().unwrap().len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModuleGraph for MemoryModuleGraph {
    fn modules(&self) -> Vec<Arc<ModuleRecord>> {
        self.modules.read().unwrap().values().cloned().collect()
    }

    fn module_by_id(&self, id: &str) -> Option<Arc<ModuleRecord>> {
        self.modules.read().unwrap().get(id).cloned()
    }
}
