//! Run statistics, updated from concurrent tasks via atomic counters.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters for one engine run.
#[derive(Debug, Default)]
pub struct RunStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    previously_completed: AtomicUsize,
    retried: AtomicUsize,
    scrape_failures: AtomicUsize,
    hashed: AtomicUsize,
    previously_hashed: AtomicUsize,
    removed_files: AtomicUsize,
}

impl RunStats {
    /// Creates a zeroed stats tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Successfully completed downloads.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Terminal download failures.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Items skipped by filetype/duration policy.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Items already complete in the history ledger or on disk.
    #[must_use]
    pub fn previously_completed(&self) -> usize {
        self.previously_completed.load(Ordering::SeqCst)
    }

    /// Retry attempts consumed across all items.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Extractor-level failures.
    #[must_use]
    pub fn scrape_failures(&self) -> usize {
        self.scrape_failures.load(Ordering::SeqCst)
    }

    /// Files hashed this run.
    #[must_use]
    pub fn hashed(&self) -> usize {
        self.hashed.load(Ordering::SeqCst)
    }

    /// Files whose hash was reused from the durable index.
    #[must_use]
    pub fn previously_hashed(&self) -> usize {
        self.previously_hashed.load(Ordering::SeqCst)
    }

    /// Duplicate files removed by dedup cleanup.
    #[must_use]
    pub fn removed_files(&self) -> usize {
        self.removed_files.load(Ordering::SeqCst)
    }

    pub fn add_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_previously_completed(&self) {
        self.previously_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_scrape_failure(&self) {
        self.scrape_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_hashed(&self) {
        self.hashed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_previously_hashed(&self) {
        self.previously_hashed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_removed_file(&self) {
        self.removed_files.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether any terminal failure was recorded (drives exit code 2).
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed() > 0 || self.scrape_failures() > 0
    }
}
