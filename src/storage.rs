//! Storage monitor: free-space polling and the pause-on-full safety loop.
//!
//! A long-lived task polls disk usage every two seconds for the mounts
//! observed in use, logging a detailed status line every ten polls. Before a
//! download streams any bytes, [`StorageMonitor::check_free_space`] resolves
//! the target folder's mount (longest matching mountpoint prefix) and either
//! admits the download, pauses the RUNNING latch until space frees up, or
//! fails the item.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sysinfo::Disks;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::Settings;
use crate::errors::CdlError;
use crate::items::MediaItem;
use crate::state::RunState;

/// Poll period for the free-space loop.
const POLL_PERIOD: Duration = Duration::from_secs(2);

/// Log a detailed storage status every this many polls.
const LOG_EVERY_POLLS: u64 = 10;

/// Free-space monitor shared by all downloaders.
#[derive(Debug)]
pub struct StorageMonitor {
    state: RunState,
    required_free_space: u64,
    pause_if_no_free_space: bool,
    /// Mountpoints available at startup, sorted. Like the partition table,
    /// this snapshot is taken once.
    mounts: Vec<PathBuf>,
    free_space: DashMap<PathBuf, u64>,
    used_mounts: Mutex<BTreeSet<PathBuf>>,
    handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StorageMonitor {
    /// Creates a monitor, snapshotting the mount table.
    #[must_use]
    pub fn new(state: RunState, settings: &Settings) -> Self {
        let mut mounts: Vec<PathBuf> = Disks::new_with_refreshed_list()
            .iter()
            .map(|disk| disk.mount_point().to_path_buf())
            .collect();
        mounts.sort();
        mounts.dedup();
        Self::with_mounts(state, settings, mounts)
    }

    /// Creates a monitor over an explicit mount list (tests use this to
    /// avoid depending on the host's partition table).
    #[must_use]
    pub fn with_mounts(state: RunState, settings: &Settings, mounts: Vec<PathBuf>) -> Self {
        Self {
            state,
            required_free_space: settings.general.required_free_space,
            pause_if_no_free_space: settings.general.pause_on_insufficient_space,
            mounts,
            free_space: DashMap::new(),
            used_mounts: Mutex::new(BTreeSet::new()),
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Starts the polling loop.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            monitor.poll_loop().await;
        });
        if let Ok(mut guard) = self.handle.lock() {
            *guard = Some(handle);
        }
    }

    /// Cancels the polling loop.
    pub fn close(&self) {
        if let Ok(mut guard) = self.handle.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }

    /// Verifies there is enough free space to download this item.
    ///
    /// When the mount is below `required_free_space` and pause-on-full is
    /// enabled, the RUNNING latch is flipped to PAUSED and the check waits
    /// for it to be set again, then re-checks once (no second pause).
    ///
    /// # Errors
    ///
    /// Returns [`CdlError::InsufficientFreeSpace`] when space is exhausted
    /// and pausing is disabled or already consumed.
    #[instrument(level = "debug", skip(self, item), fields(folder = %item.download_folder.display()))]
    pub async fn check_free_space(&self, item: &MediaItem) -> Result<(), CdlError> {
        self.check_free_space_inner(item, false).await
    }

    async fn check_free_space_inner(
        &self,
        item: &MediaItem,
        no_pause: bool,
    ) -> Result<(), CdlError> {
        if self.has_sufficient_space(&item.download_folder).await? {
            return Ok(());
        }
        if self.pause_if_no_free_space && !no_pause {
            warn!(
                folder = %item.download_folder.display(),
                "free space exhausted, pausing downloads"
            );
            self.state.pause();
            self.state.wait_running().await;
            return Box::pin(self.check_free_space_inner(item, true)).await;
        }
        Err(CdlError::InsufficientFreeSpace {
            folder: item.download_folder.clone(),
        })
    }

    async fn has_sufficient_space(&self, folder: &Path) -> Result<bool, CdlError> {
        let Some(mount) = self.mount_of(folder) else {
            // No known mount contains the folder (e.g. disconnected drive).
            return Ok(false);
        };

        if !self.free_space.contains_key(&mount) {
            // Query this mount now; the poll loop covers it from here on.
            let probed = probe_free_space(mount.clone()).await;
            if let Some(free) = probed {
                self.free_space.insert(mount.clone(), free);
            }
            self.used_mounts.lock().await.insert(mount.clone());
        }

        Ok(self
            .free_space
            .get(&mount)
            .is_some_and(|free| *free > self.required_free_space))
    }

    /// Longest mountpoint prefix of `folder` from the startup snapshot.
    #[must_use]
    pub fn mount_of(&self, folder: &Path) -> Option<PathBuf> {
        self.mounts
            .iter()
            .filter(|mount| folder.starts_with(mount))
            .max_by_key(|mount| mount.components().count())
            .cloned()
    }

    async fn poll_loop(&self) {
        let mut polls: u64 = 0;
        loop {
            self.state.wait_running().await;
            polls += 1;
            let used: Vec<PathBuf> = {
                let guard = self.used_mounts.lock().await;
                guard.iter().cloned().collect()
            };
            for mount in used {
                if let Some(free) = probe_free_space(mount.clone()).await {
                    self.free_space.insert(mount, free);
                }
            }
            if polls % LOG_EVERY_POLLS == 0 {
                let status: Vec<String> = self
                    .free_space
                    .iter()
                    .map(|entry| format!("{}={}B free", entry.key().display(), entry.value()))
                    .collect();
                debug!(status = %status.join(", "), "storage status");
            }
            tokio::time::sleep(POLL_PERIOD).await;
        }
    }

    /// Overrides a mount's free-space reading (tests drive the pause loop
    /// with this).
    pub fn set_free_space(&self, mount: PathBuf, free: u64) {
        self.free_space.insert(mount, free);
    }
}

/// Reads a mount's available bytes off the event loop.
async fn probe_free_space(mount: PathBuf) -> Option<u64> {
    tokio::task::spawn_blocking(move || {
        Disks::new_with_refreshed_list()
            .iter()
            .find(|disk| disk.mount_point() == mount)
            .map(sysinfo::Disk::available_space)
    })
    .await
    .ok()
    .flatten()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn media_item(folder: &Path) -> MediaItem {
        let url: url::Url = "https://example.host/a.jpg".parse().unwrap();
        MediaItem::new(url.clone(), url, folder.to_path_buf())
    }

    fn monitor(required: u64, mounts: Vec<PathBuf>) -> StorageMonitor {
        let mut settings = Settings::default();
        settings.general.required_free_space = required;
        StorageMonitor::with_mounts(RunState::new(), &settings, mounts)
    }

    #[test]
    fn test_mount_of_prefers_longest_prefix() {
        let monitor = monitor(
            0,
            vec![
                PathBuf::from("/"),
                PathBuf::from("/mnt"),
                PathBuf::from("/mnt/media"),
            ],
        );
        assert_eq!(
            monitor.mount_of(Path::new("/mnt/media/downloads")),
            Some(PathBuf::from("/mnt/media"))
        );
        assert_eq!(
            monitor.mount_of(Path::new("/var/tmp")),
            Some(PathBuf::from("/"))
        );
    }

    #[test]
    fn test_mount_of_none_when_no_prefix_matches() {
        let monitor = monitor(0, vec![PathBuf::from("/mnt/media")]);
        assert_eq!(monitor.mount_of(Path::new("/var/tmp")), None);
    }

    #[tokio::test]
    async fn test_check_passes_with_enough_space() {
        let monitor = monitor(100, vec![PathBuf::from("/mnt/media")]);
        monitor.set_free_space(PathBuf::from("/mnt/media"), 1_000);
        let item = media_item(Path::new("/mnt/media/downloads"));
        assert!(monitor.check_free_space(&item).await.is_ok());
    }

    #[tokio::test]
    async fn test_check_fails_without_pause_policy() {
        let mut settings = Settings::default();
        settings.general.required_free_space = 100;
        settings.general.pause_on_insufficient_space = false;
        let monitor = StorageMonitor::with_mounts(
            RunState::new(),
            &settings,
            vec![PathBuf::from("/mnt/media")],
        );
        monitor.set_free_space(PathBuf::from("/mnt/media"), 10);

        let item = media_item(Path::new("/mnt/media/downloads"));
        let err = monitor.check_free_space(&item).await.unwrap_err();
        assert!(matches!(err, CdlError::InsufficientFreeSpace { .. }));
    }

    #[tokio::test]
    async fn test_check_pauses_then_recovers() {
        let state = RunState::new();
        let mut settings = Settings::default();
        settings.general.required_free_space = 100;
        let monitor = Arc::new(StorageMonitor::with_mounts(
            state.clone(),
            &settings,
            vec![PathBuf::from("/mnt/media")],
        ));
        monitor.set_free_space(PathBuf::from("/mnt/media"), 10);

        let item = media_item(Path::new("/mnt/media/downloads"));
        let checker = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.check_free_space(&item).await })
        };

        // The check must flip the latch to PAUSED.
        tokio::time::timeout(Duration::from_secs(1), async {
            while state.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("check must pause the run");

        // Free space recovers, the run resumes, the check passes.
        monitor.set_free_space(PathBuf::from("/mnt/media"), 1_000);
        state.resume();
        let result = tokio::time::timeout(Duration::from_secs(1), checker)
            .await
            .expect("checker must finish")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_check_fails_after_single_pause_without_recovery() {
        let state = RunState::new();
        let mut settings = Settings::default();
        settings.general.required_free_space = 100;
        let monitor = Arc::new(StorageMonitor::with_mounts(
            state.clone(),
            &settings,
            vec![PathBuf::from("/mnt/media")],
        ));
        monitor.set_free_space(PathBuf::from("/mnt/media"), 10);

        let item = media_item(Path::new("/mnt/media/downloads"));
        let checker = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.check_free_space(&item).await })
        };

        tokio::time::timeout(Duration::from_secs(1), async {
            while state.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("check must pause the run");

        // Resume without freeing space: the second check fails, no second
        // pause.
        state.resume();
        let result = tokio::time::timeout(Duration::from_secs(1), checker)
            .await
            .expect("checker must finish")
            .unwrap();
        assert!(matches!(
            result,
            Err(CdlError::InsufficientFreeSpace { .. })
        ));
        assert!(state.is_running(), "no second pause may occur");
    }

    #[tokio::test]
    async fn test_unknown_mount_is_insufficient() {
        let mut settings = Settings::default();
        settings.general.required_free_space = 100;
        settings.general.pause_on_insufficient_space = false;
        let monitor = StorageMonitor::with_mounts(
            RunState::new(),
            &settings,
            vec![PathBuf::from("/mnt/media")],
        );
        let item = media_item(Path::new("/detached/usb"));
        let err = monitor.check_free_space(&item).await.unwrap_err();
        assert!(matches!(err, CdlError::InsufficientFreeSpace { .. }));
    }
}
