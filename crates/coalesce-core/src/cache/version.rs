use serde::{Deserialize, Serialize};
use std::fmt;

/// Token stamping one generation of the bundle + source map pair.
///
/// Millisecond wall-clock timestamps, strictly increasing within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheVersion(u64);

impl CacheVersion {
    /// Version for the current instant.
    #[must_use]
    pub fn now() -> Self {
        Self(now_ms())
    }

    /// A version later than `self`, even if the clock has not moved.
    #[must_use]
    pub fn next(self) -> Self {
        Self(now_ms().max(self.0 + 1))
    }

    /// Raw millisecond value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for CacheVersion {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
