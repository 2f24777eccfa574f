//! Downloader engine: per-domain downloaders behind a coordinator that
//! consumes the scraper's media-item stream.

pub mod downloader;
pub mod file_locks;
pub mod hls;

pub use downloader::{Downloader, DownloaderEnv, GENERIC_CRAWLERS, KNOWN_BAD_URLS};
pub use file_locks::FileLocksVault;
pub use hls::{create_segments, segment_padding, valid_segment_lines, HlsSegment};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::items::MediaItem;
use crate::scrape::QueuedMedia;

/// Owns one [`Downloader`] per domain and drives the download task group.
pub struct DownloadCoordinator {
    env: DownloaderEnv,
    downloaders: DashMap<String, Arc<Downloader>>,
    completed_items: Mutex<Vec<MediaItem>>,
}

impl DownloadCoordinator {
    /// Creates a coordinator over the shared downloader environment.
    #[must_use]
    pub fn new(env: DownloaderEnv) -> Self {
        Self {
            env,
            downloaders: DashMap::new(),
            completed_items: Mutex::new(Vec::new()),
        }
    }

    /// Returns (creating lazily) the downloader for a domain.
    #[must_use]
    pub fn downloader_for(&self, domain: &str) -> Arc<Downloader> {
        self.downloaders
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(Downloader::new(self.env.clone(), domain)))
            .clone()
    }

    /// Consumes queued media items until the channel closes and every
    /// spawned download task finishes.
    pub async fn run(self: Arc<Self>, mut media_rx: mpsc::UnboundedReceiver<QueuedMedia>) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                maybe_media = media_rx.recv() => {
                    let Some(queued) = maybe_media else { break };
                    let downloader = self.downloader_for(&queued.domain);
                    let coordinator = Arc::clone(&self);
                    tasks.spawn(async move {
                        let QueuedMedia { media_item, m3u8_content, .. } = queued;
                        let snapshot = media_item.clone();
                        if downloader.run(media_item, &m3u8_content).await {
                            coordinator.completed_items.lock().await.push(snapshot);
                        }
                    });
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(join_error) = result {
                        warn!(error = %join_error, "download task panicked");
                    }
                }
            }
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(join_error) = result {
                warn!(error = %join_error, "download task panicked");
            }
        }
        info!("download task group drained");
    }

    /// Media items completed this run (for the post-run hash pass).
    pub async fn completed_items(&self) -> Vec<MediaItem> {
        self.completed_items.lock().await.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::Settings;
    use crate::db::Database;
    use crate::failure_log::FailureLog;
    use crate::hashing::{HashClient, HashStore};
    use crate::history::HistoryStore;
    use crate::http::DownloadClient;
    use crate::limits::RateLimitFabric;
    use crate::progress::RunStats;
    use crate::state::RunState;
    use crate::storage::StorageMonitor;
    use url::Url;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn env(dir: &std::path::Path) -> DownloaderEnv {
        let mut settings = Settings::default();
        settings.general.required_free_space = 0;
        settings.rate_limiting.download_delay = 0.0;
        let settings = Arc::new(settings);
        let jar = Arc::new(reqwest::cookie::Jar::default());
        let db = Database::new_in_memory().await.unwrap();
        let stats = Arc::new(RunStats::new());
        let state = RunState::new();
        let storage = Arc::new(StorageMonitor::with_mounts(
            state.clone(),
            &settings,
            vec![PathBuf::from("/")],
        ));
        storage.set_free_space(PathBuf::from("/"), u64::MAX);
        DownloaderEnv {
            client: Arc::new(DownloadClient::new(Arc::clone(&jar), &settings).unwrap()),
            fabric: Arc::new(RateLimitFabric::new(&settings.rate_limiting)),
            history: HistoryStore::new(db.clone()),
            hasher: Arc::new(HashClient::new(
                HashStore::new(db),
                &settings,
                Arc::clone(&stats),
            )),
            storage,
            state,
            locks: Arc::new(FileLocksVault::new()),
            stats,
            failure_log: Arc::new(FailureLog::new(dir.join("failures.csv"))),
            settings,
        }
    }

    #[tokio::test]
    async fn test_coordinator_downloads_queued_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 10]))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(url_path("/b.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![2u8; 20]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path()).await;
        let coordinator = Arc::new(DownloadCoordinator::new(env.clone()));

        let (media_tx, media_rx) = mpsc::unbounded_channel();
        for name in ["a.jpg", "b.jpg"] {
            let url: Url = format!("{}/{name}", server.uri()).parse().unwrap();
            media_tx
                .send(QueuedMedia {
                    domain: "example".to_string(),
                    media_item: MediaItem::new(url.clone(), url, dir.path().join("dl")),
                    m3u8_content: String::new(),
                })
                .unwrap();
        }
        drop(media_tx);

        Arc::clone(&coordinator).run(media_rx).await;
        assert_eq!(env.stats.completed(), 2);
        assert_eq!(coordinator.completed_items().await.len(), 2);
        assert!(dir.path().join("dl/a.jpg").exists());
        assert!(dir.path().join("dl/b.jpg").exists());
    }

    #[tokio::test]
    async fn test_downloader_instances_are_per_domain() {
        let dir = tempfile::tempdir().unwrap();
        let env = env(dir.path()).await;
        let coordinator = DownloadCoordinator::new(env);

        let first = coordinator.downloader_for("bunkrr");
        let again = coordinator.downloader_for("bunkrr");
        let other = coordinator.downloader_for("coomer");
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(other.domain(), "coomer");
    }
}
