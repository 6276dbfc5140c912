#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_panics_doc)]

//! Cached module bundles for unbundled dev servers.
//!
//! Instead of one request per module, every module the host has already
//! transformed is aggregated into a single versioned bundle that a patched
//! module loader consumes. Anything not cached (or invalidated by a file
//! change) falls back to the normal per-module request.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod graph;
pub mod hmr;
pub mod plugin;
pub mod transform;
pub mod url;

pub use cache::{CacheController, CacheVersion, GeneratedBundle, SectionSourceMap};
pub use client::{ClientAssets, LoaderExtension, LoaderSession, ModuleLoader};
pub use config::PluginOptions;
pub use error::Error;
pub use hmr::HmrMessage;
pub use graph::{MemoryModuleGraph, ModuleGraph, ModuleRecord, TransformResult};
pub use plugin::{CoalescePlugin, VirtualResponse, VirtualRoute};
pub use transform::{ModuleConverter, SystemConverter, TransformPool};
