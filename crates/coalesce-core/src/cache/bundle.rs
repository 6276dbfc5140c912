//! Aggregated bundle generation.
//!
//! The bundle is one script that fills a global `Map` from module URL to a
//! thunk running that module's registration code. A flag line before each
//! entry names the module, so the source map builder can attribute line
//! ranges without parsing any module code:
//!
//! ```text
//! window.__COALESCE_CACHE_VERSION__ = 1700000000000;
//! window.__COALESCE_CACHED_MODULES__ = new Map([
//! //#__COALESCE_CODE_INTERVAL__=/project/src/main.js
//! ["/src/main.js", { code: () => { System.register("/src/main.js", ...
//! } }],
//! ]);
//! //# sourceMappingURL=/@coalesce/modules.js.map?v=1700000000000
//! ```

use std::sync::Arc;

use tracing::debug;

use super::CacheVersion;
use crate::graph::ModuleRecord;

/// Prefix of the line marking the start of a module's block.
pub const CODE_INTERVAL_FLAG: &str = "//#__COALESCE_CODE_INTERVAL__=";

/// Global the bundle stores cached modules in.
pub const CACHED_MODULES_GLOBAL: &str = "__COALESCE_CACHED_MODULES__";

/// Global the bundle stores its cache version in.
pub const CACHE_VERSION_GLOBAL: &str = "__COALESCE_CACHE_VERSION__";

/// Bundle text stamped with the version it was generated for.
#[derive(Debug, Clone)]
pub struct GeneratedBundle {
    /// Cache version active at generation time.
    pub version: CacheVersion,
    /// Full bundle text, including the trailing sourcemap comment.
    pub code: Arc<str>,
    /// Number of module blocks in the bundle.
    pub module_count: usize,
}

/// Flag line for a module id.
#[must_use]
pub fn flag_line(module_id: &str) -> String {
    format!("{CODE_INTERVAL_FLAG}{module_id}")
}

/// Whether a bundle line is a code-interval flag.
#[must_use]
pub fn is_flag_line(line: &str) -> bool {
    line.starts_with(CODE_INTERVAL_FLAG)
}

/// Module id encoded in a flag line.
#[must_use]
pub fn parse_flag_line(line: &str) -> Option<&str> {
    line.strip_prefix(CODE_INTERVAL_FLAG).map(str::trim)
}

/// Concatenate module records into a bundle.
///
/// Records without an id or without code are skipped, as are records whose
/// code is not in loader format and records whose code has a line that would
/// read as a flag.
#[must_use]
pub fn generate_bundle(
    modules: &[Arc<ModuleRecord>],
    source_map_url: &str,
    version: CacheVersion,
) -> GeneratedBundle {
    let mut code = String::with_capacity(
        modules
            .iter()
            .filter_map(|m| m.cached_result())
            .map(|r| r.code.len() + 64)
            .sum::<usize>()
            + 256,
    );
    code.push_str(&format!("window.{CACHE_VERSION_GLOBAL} = {version};\n"));
    code.push_str(&format!("window.{CACHED_MODULES_GLOBAL} = new Map(["));

    let mut module_count = 0;
    for module in modules {
        let Some(id) = module.id.as_deref() else {
            continue;
        };
        let Some(result) = module.cached_result().filter(|r| !r.code.is_empty()) else {
            continue;
        };
        if !result.converted {
            debug!(module = %id, "module code is not in loader format, left out of bundle");
            continue;
        }
        if result.code.lines().any(is_flag_line) {
            debug!(module = %id, "module code contains a code-interval flag, left out of bundle");
            continue;
        }

        code.push('\n');
        code.push_str(&flag_line(id));
        code.push('\n');
        code.push('[');
        code.push_str(&json_string(&module.url));
        code.push_str(", { code: () => { ");
        code.push_str(&result.code);
        code.push_str("\n} }],");
        module_count += 1;
    }

    code.push_str("\n]);\n");
    code.push_str(&format!("//# sourceMappingURL={source_map_url}?v={version}\n"));

    GeneratedBundle {
        version,
        code: Arc::from(code),
        module_count,
    }
}

fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}
