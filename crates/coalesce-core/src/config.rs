//! Plugin configuration.
//!
//! Options are read from an optional `coalesce.json` at the project root.
//! Every field has a default, so an absent file or a partial file is fine:
//!
//! ```json
//! {
//!   "maxUncachedModules": 40,
//!   "workers": 4,
//!   "loaderPath": "vendor/system.min.js"
//! }
//! ```

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file name looked up at the project root.
pub const CONFIG_FILE: &str = "coalesce.json";

/// Configuration for the cached-bundle plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct PluginOptions {
    /// Turn the cached bundle off entirely (plain per-module serving).
    pub enabled: bool,

    /// Virtual path the aggregated bundle is served from.
    pub bundle_url: String,

    /// Virtual path the index source map is served from.
    pub source_map_url: String,

    /// Cache misses tolerated in one page load before the client asks the
    /// server to regenerate the bundle on the next reload.
    pub max_uncached_modules: usize,

    /// Transform pool size. `None` uses one worker per logical CPU.
    pub workers: Option<usize>,

    /// URL fragment identifying external dependencies.
    pub external_dir: String,

    /// Query marker identifying background-worker entry modules.
    pub worker_query_marker: String,

    /// Extensions probed, in order, for extensionless specifiers.
    pub extensions: Vec<String>,

    /// Module loader library inlined into the page, relative to the root.
    pub loader_path: PathBuf,

    /// `Cache-Control` header for both virtual routes.
    pub cache_control: String,
}

impl Default for PluginOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            bundle_url: "/@coalesce/modules.js".to_string(),
            source_map_url: "/@coalesce/modules.js.map".to_string(),
            max_uncached_modules: 20,
            workers: None,
            external_dir: "/node_modules/".to_string(),
            worker_query_marker: "worker_file".to_string(),
            extensions: ["mjs", "js", "ts", "mts", "jsx"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            loader_path: PathBuf::from("node_modules/systemjs/dist/system.min.js"),
            cache_control: "max-age=3600, immutable".to_string(),
        }
    }
}

impl PluginOptions {
    /// Load options from `path`.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load options for a project.
    ///
    /// An explicit `config` path must exist. Without one, `coalesce.json` in
    /// `root` is used when present and defaults otherwise.
    pub fn load(root: &Path, config: Option<&Path>) -> Result<Self, Error> {
        match config {
            Some(path) => {
                let abs = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    root.join(path)
                };
                Self::from_file(&abs)
            }
            None => {
                let path = root.join(CONFIG_FILE);
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Whether a URL points into the external dependency directory.
    #[must_use]
    pub fn is_external(&self, url: &str) -> bool {
        url.contains(&self.external_dir)
    }

    /// Whether a module id or URL is a background-worker entry point.
    #[must_use]
    pub fn is_worker_entry(&self, id: &str) -> bool {
        crate::url::has_query_marker(id, &self.worker_query_marker)
    }
}
