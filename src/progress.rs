//! Observable progress for a long-running ingestion job.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Handle onto the counters of one ingestion run.
///
/// Single writer (the ingestion job), many readers (status pollers).
/// Readers take point-in-time snapshots and may observe in-progress values;
/// the only guarantee is that `is_complete` is monotonic and set exactly
/// once, even when the run dies on a fatal error. The handle is scoped to
/// one invocation — a fresh run gets a fresh handle.
#[derive(Clone, Default)]
pub struct IndexingProgress {
    inner: Arc<ProgressInner>,
}

#[derive(Default)]
struct ProgressInner {
    total: AtomicUsize,
    current: AtomicUsize,
    complete: AtomicBool,
    last_item: Mutex<Option<String>>,
}

/// Point-in-time view of an ingestion run, serializable for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    /// Metadata log line count, known after the pre-scan (0 until then).
    pub total: usize,
    /// Lines consumed so far.
    pub current: usize,
    /// Whether the run has terminated, successfully or not.
    pub is_complete: bool,
    /// Title of the most recently processed listing.
    pub last_item: Option<String>,
}

impl IndexingProgress {
    /// Creates a fresh handle with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the pre-scanned line count.
    pub fn set_total(&self, total: usize) {
        self.inner.total.store(total, Ordering::Release);
    }

    /// Records the number of lines consumed so far.
    pub fn set_current(&self, current: usize) {
        self.inner.current.store(current, Ordering::Release);
    }

    /// Records the title of the listing most recently processed.
    pub fn set_last_item(&self, title: String) {
        if let Ok(mut guard) = self.inner.last_item.lock() {
            *guard = Some(title);
        }
    }

    /// Marks the run as terminated. Irreversible.
    pub fn mark_complete(&self) {
        self.inner.complete.store(true, Ordering::Release);
    }

    /// Whether the run has terminated.
    pub fn is_complete(&self) -> bool {
        self.inner.complete.load(Ordering::Acquire)
    }

    /// Takes a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.inner.total.load(Ordering::Acquire),
            current: self.inner.current.load(Ordering::Acquire),
            is_complete: self.is_complete(),
            last_item: self
                .inner
                .last_item
                .lock()
                .ok()
                .and_then(|guard| guard.clone()),
        }
    }
}

/// Cooperative cancellation flag checked by the ingestion loop between
/// listings. Requesting cancellation never interrupts the image currently
/// being indexed.
#[derive(Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    /// Creates a flag in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_writes() {
        let progress = IndexingProgress::new();
        progress.set_total(12);
        progress.set_current(3);
        progress.set_last_item("Fox Plush".to_string());

        let snap = progress.snapshot();
        assert_eq!(snap.total, 12);
        assert_eq!(snap.current, 3);
        assert!(!snap.is_complete);
        assert_eq!(snap.last_item.as_deref(), Some("Fox Plush"));
    }

    #[test]
    fn completion_is_monotonic() {
        let progress = IndexingProgress::new();
        progress.mark_complete();
        progress.set_current(99);
        assert!(progress.snapshot().is_complete);
    }

    #[test]
    fn clones_share_state() {
        let progress = IndexingProgress::new();
        let reader = progress.clone();
        progress.set_current(7);
        assert_eq!(reader.snapshot().current, 7);

        let cancel = CancelFlag::new();
        let observer = cancel.clone();
        cancel.cancel();
        assert!(observer.is_cancelled());
    }
}
