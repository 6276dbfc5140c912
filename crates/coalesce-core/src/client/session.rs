//! Mutable state of one loader extension instance.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Callback asking the server to regenerate the bundle.
pub type UpdateNotifier = Arc<dyn Fn() + Send + Sync>;

/// Miss counter, notification flag, replay flag and URL sets shared by the
/// extension's hooks.
///
/// The miss counter and notification flag are reset only when a new cache
/// version is installed.
#[derive(Default)]
pub struct LoaderSession {
    miss_count: AtomicUsize,
    notified: AtomicBool,
    replaying: AtomicBool,
    explicit_imports: Mutex<HashSet<String>>,
    invalidated: RwLock<HashSet<String>>,
    notifier: RwLock<Option<UpdateNotifier>>,
}

impl std::fmt::Debug for LoaderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderSession")
            .field("miss_count", &self.miss_count())
            .field("notified", &self.notified())
            .field("replaying", &self.is_replaying())
            .finish_non_exhaustive()
    }
}

impl LoaderSession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of uncached modules fetched since the last cache install.
    pub fn miss_count(&self) -> usize {
        self.miss_count.load(Ordering::SeqCst)
    }

    /// Whether the update notifier has fired for the current cache version.
    pub fn notified(&self) -> bool {
        self.notified.load(Ordering::SeqCst)
    }

    /// Count one miss; returns the new total.
    pub(crate) fn record_miss(&self) -> usize {
        self.miss_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fire the notifier if misses exceed `threshold`, at most once per
    /// cache version. Returns whether it fired.
    pub(crate) fn maybe_notify(&self, threshold: usize) -> bool {
        if self.miss_count() <= threshold {
            return false;
        }
        let notifier = self.notifier.read().unwrap().clone();
        let Some(notifier) = notifier else {
            return false;
        };
        if self.notified.swap(true, Ordering::SeqCst) {
            return false;
        }
        notifier();
        true
    }

    /// Re-arm the miss threshold.
    pub(crate) fn reset(&self) {
        self.miss_count.store(0, Ordering::SeqCst);
        self.notified.store(false, Ordering::SeqCst);
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }

    /// Set the replay flag until the returned guard is dropped.
    pub(crate) fn begin_replay(&self) -> ReplayGuard<'_> {
        self.replaying.store(true, Ordering::SeqCst);
        ReplayGuard { session: self }
    }

    pub(crate) fn mark_explicit(&self, urls: &[String]) {
        let mut explicit = self.explicit_imports.lock().unwrap();
        explicit.extend(urls.iter().cloned());
    }

    pub(crate) fn unmark_explicit(&self, urls: &[String]) {
        let mut explicit = self.explicit_imports.lock().unwrap();
        for url in urls {
            explicit.remove(url);
        }
    }

    /// Whether `name` is being imported through the extension right now.
    pub fn is_explicit(&self, name: &str) -> bool {
        self.explicit_imports.lock().unwrap().contains(name)
    }

    /// Replace the invalidated set with the page's snapshot.
    pub fn seed_invalidated<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut invalidated = self.invalidated.write().unwrap();
        *invalidated = urls.into_iter().map(Into::into).collect();
    }

    /// Add URLs announced by the server.
    pub fn mark_invalidated<I, S>(&self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut invalidated = self.invalidated.write().unwrap();
        invalidated.extend(urls.into_iter().map(Into::into));
    }

    pub fn is_invalidated(&self, url: &str) -> bool {
        self.invalidated.read().unwrap().contains(url)
    }

    pub fn set_update_notifier(&self, notifier: UpdateNotifier) {
        *self.notifier.write().unwrap() = Some(notifier);
    }
}

/// Clears the replay flag on drop.
pub(crate) struct ReplayGuard<'a> {
    session: &'a LoaderSession,
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.session.replaying.store(false, Ordering::SeqCst);
    }
}
