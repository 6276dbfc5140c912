//! Conversion of single modules into loader format.
//!
//! The converter is a pure function of the module source: every import is
//! treated as external, so only the module syntax changes and nothing is
//! resolved. Conversions run on a worker pool off the request path.

mod line_map;
pub mod pool;
pub mod system;

pub use pool::TransformPool;
pub use system::SystemConverter;

use thiserror::Error;

/// Output of a successful conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedModule {
    /// Converted code.
    pub code: String,
    /// V3 source map for `code`, when the converter produced one.
    pub map: Option<serde_json::Value>,
}

/// Why a conversion failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("unsupported syntax at line {line}: {message}")]
    Unsupported { line: usize, message: String },

    #[error("unterminated statement starting at line {line}")]
    Unterminated { line: usize },

    #[error("{0}")]
    Other(String),
}

/// Converts one module's source into loader-compatible code.
///
/// Implementations must be callable from any worker thread.
pub trait ModuleConverter: Send + Sync + 'static {
    /// Converter name (for logs).
    fn name(&self) -> &'static str;

    /// Convert `source` of module `id`, registering it under `name`.
    fn convert(&self, source: &str, id: &str, name: &str) -> Result<ConvertedModule, ConvertError>;
}
