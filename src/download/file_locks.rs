//! Keyed lock vault serializing writes to the same on-disk filename.
//!
//! Locks are created lazily per filename and shared across every
//! downloader, so no two downloads ever open the same `.part` concurrently,
//! even when different extractors resolve to the same target path.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Process-wide vault of per-filename locks.
#[derive(Debug, Default)]
pub struct FileLocksVault {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileLocksVault {
    /// Creates an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for a filename, creating it if none exists.
    ///
    /// The guard is owned, so it can be held across awaits and is released
    /// on drop, including on cancellation.
    pub async fn get_lock(&self, filename: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(filename.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        debug!(filename, "waiting for file lock");
        lock.lock_owned().await
    }

    /// Number of distinct filenames seen (test hook).
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the vault has seen no filenames yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_same_filename_serializes() {
        let vault = Arc::new(FileLocksVault::new());

        let first = vault.get_lock("a.jpg").await;
        let waiter = {
            let vault = Arc::clone(&vault);
            tokio::spawn(async move {
                let _guard = vault.get_lock("a.jpg").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second holder must wait");

        drop(first);
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter must acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_filenames_are_independent() {
        let vault = FileLocksVault::new();
        let _a = vault.get_lock("a.jpg").await;
        // Must not deadlock.
        let _b = tokio::time::timeout(Duration::from_millis(100), vault.get_lock("b.jpg"))
            .await
            .expect("different filename must not block");
        assert_eq!(vault.len(), 2);
    }

    #[tokio::test]
    async fn test_lock_reused_for_same_filename() {
        let vault = FileLocksVault::new();
        drop(vault.get_lock("a.jpg").await);
        drop(vault.get_lock("a.jpg").await);
        assert_eq!(vault.len(), 1);
    }
}
