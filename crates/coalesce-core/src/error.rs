use std::path::PathBuf;
use thiserror::Error;

/// Core error type for coalesce operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Module loader library not found at {path}: {source}")]
    LoaderMissing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start transform pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
