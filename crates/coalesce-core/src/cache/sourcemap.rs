//! Index source map for the aggregated bundle.
//!
//! Builds a V3 index map (`sections`) instead of a flat map: each module's own
//! map is reused as-is, offset to where its block starts in the bundle. No
//! module code is re-parsed; the bundle is scanned once for flag lines.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::bundle::parse_flag_line;
use crate::graph::ModuleGraph;

/// Position of a section within the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionOffset {
    pub line: u32,
    pub column: u32,
}

/// One module's map placed at its block offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub offset: SectionOffset,
    pub map: Value,
}

/// V3 index source map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionSourceMap {
    pub version: u32,
    pub sections: Vec<Section>,
}

impl Default for SectionSourceMap {
    fn default() -> Self {
        Self {
            version: 3,
            sections: Vec::new(),
        }
    }
}

impl SectionSourceMap {
    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Lazy `(line_number, text)` iterator over a bundle, 1-based.
pub fn numbered_lines(code: &str) -> impl Iterator<Item = (u32, &str)> {
    code.lines().zip(1u32..).map(|(line, number)| (number, line))
}

/// Build the index map for `code`, looking module maps up in `graph`.
///
/// A flag whose module is gone from the graph, or has no map, adds no
/// section; positions inside that block resolve to nothing.
pub fn build_index_map(code: &str, graph: &dyn ModuleGraph) -> SectionSourceMap {
    let mut map = SectionSourceMap::default();

    for (line_number, line) in numbered_lines(code) {
        let Some(module_id) = parse_flag_line(line) else {
            continue;
        };
        let Some(module) = graph.module_by_id(module_id) else {
            continue;
        };
        let Some(module_map) = module.cached_result().and_then(|r| r.map.as_deref()) else {
            continue;
        };
        let Value::Object(fields) = module_map else {
            continue;
        };

        let mut fields = fields.clone();
        fields.insert(
            "sources".to_string(),
            Value::Array(vec![Value::String(module.url.clone())]),
        );
        map.sections.push(Section {
            offset: SectionOffset {
                line: line_number,
                column: 0,
            },
            map: Value::Object(fields),
        });
    }

    map
}

/// Build and serialize the index map, logging how long it took.
pub fn generate_source_map(code: &str, graph: &dyn ModuleGraph) -> Result<String, serde_json::Error> {
    let start = Instant::now();
    let json = build_index_map(code, graph).to_json()?;
    info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Generated source map within {}ms",
        start.elapsed().as_millis()
    );
    Ok(json)
}
