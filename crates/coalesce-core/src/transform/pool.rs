//! Worker pool for module conversion.
//!
//! Submissions are queued without limit onto a fixed set of rayon workers,
//! each running one conversion at a time. Every submission gets its own
//! future; completion order is independent of submission order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::ModuleConverter;
use crate::error::Error;
use crate::graph::TransformResult;

/// Fixed-size pool running a [`ModuleConverter`].
pub struct TransformPool {
    pool: rayon::ThreadPool,
    converter: Arc<dyn ModuleConverter>,
}

impl TransformPool {
    /// Start a pool with `workers` threads (one per logical CPU when `None`).
    pub fn new(converter: Arc<dyn ModuleConverter>, workers: Option<usize>) -> Result<Self, Error> {
        let mut builder =
            rayon::ThreadPoolBuilder::new().thread_name(|i| format!("coalesce-transform-{i}"));
        if let Some(workers) = workers {
            builder = builder.num_threads(workers.max(1));
        }
        Ok(Self {
            pool: builder.build()?,
            converter,
        })
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Convert one module.
    ///
    /// Never fails: a converter error or panic yields the original code
    /// without a map.
    pub async fn transform(&self, code: String, id: String, url: String) -> TransformResult {
        let (tx, rx) = oneshot::channel();
        let converter = Arc::clone(&self.converter);
        let source = code.clone();

        self.pool.spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| converter.convert(&source, &id, &url)));
            let result = match outcome {
                Ok(Ok(converted)) => Some(TransformResult {
                    code: converted.code,
                    map: converted.map.map(Arc::new),
                    converted: true,
                }),
                Ok(Err(e)) => {
                    debug!(converter = converter.name(), module = %id, error = %e, "conversion failed, serving original code");
                    None
                }
                Err(_) => {
                    warn!(converter = converter.name(), module = %id, "converter panicked, serving original code");
                    None
                }
            };
            let _ = tx.send(result);
        });

        match rx.await {
            Ok(Some(result)) => result,
            Ok(None) | Err(_) => TransformResult::passthrough(code),
        }
    }
}
