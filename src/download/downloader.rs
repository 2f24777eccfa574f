//! Per-domain downloader: gating, the retry/resume state machine, and HLS
//! assembly.
//!
//! `run` gates each media item through the RUNNING latch, the history
//! ledger, the download-limiter triple, and the per-filename lock, then
//! drives the retry loop around the streaming client: a retry loop consuming
//! retryable failures around an exception-mapping boundary inside the
//! limiter scope.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Settings;
use crate::download::file_locks::FileLocksVault;
use crate::download::hls;
use crate::errors::CdlError;
use crate::failure_log::FailureLog;
use crate::hashing::HashClient;
use crate::history::HistoryStore;
use crate::http::{DownloadClient, StreamedBody};
use crate::items::MediaItem;
use crate::limits::RateLimitFabric;
use crate::progress::RunStats;
use crate::state::RunState;
use crate::storage::StorageMonitor;

/// Curated maintenance/placeholder URLs that fail immediately.
pub const KNOWN_BAD_URLS: &[(&str, u16)] = &[
    ("https://i.imgur.com/removed.png", 404),
    ("https://saint2.su/assets/notfound.gif", 404),
    ("https://bnkr.b-cdn.net/maintenance-vid.mp4", 503),
    ("https://bnkr.b-cdn.net/maintenance.mp4", 503),
    ("https://c.bunkr-cache.se/maintenance-vid.mp4", 503),
    ("https://c.bunkr-cache.se/maintenance.jpg", 503),
];

/// Domain tags that use the unsupported-domain log prefix.
pub const GENERIC_CRAWLERS: &[&str] = &[".", "no_crawler"];

/// Pacing between retry attempts: one second plus up to half a second of
/// jitter so simultaneous failures do not retry in lockstep.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_JITTER_MS: u64 = 500;

/// Shared dependencies for every per-domain downloader.
#[derive(Clone)]
pub struct DownloaderEnv {
    pub client: Arc<DownloadClient>,
    pub fabric: Arc<RateLimitFabric>,
    pub history: HistoryStore,
    pub hasher: Arc<HashClient>,
    pub storage: Arc<StorageMonitor>,
    pub state: RunState,
    pub locks: Arc<FileLocksVault>,
    pub stats: Arc<RunStats>,
    pub failure_log: Arc<FailureLog>,
    pub settings: Arc<Settings>,
}

/// Downloader bound to one extractor domain.
pub struct Downloader {
    env: DownloaderEnv,
    domain: String,
    log_prefix: &'static str,
    processed_paths: DashMap<String, ()>,
    current_attempt_filesize: DashMap<String, u64>,
}

impl Downloader {
    /// Creates a downloader for a domain.
    #[must_use]
    pub fn new(env: DownloaderEnv, domain: impl Into<String>) -> Self {
        let domain = domain.into();
        let log_prefix = if GENERIC_CRAWLERS.contains(&domain.as_str()) {
            "Download attempt (unsupported domain)"
        } else {
            "Download"
        };
        Self {
            env,
            domain,
            log_prefix,
            processed_paths: DashMap::new(),
            current_attempt_filesize: DashMap::new(),
        }
    }

    /// The downloader's domain tag.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Runs the download loop for one media item. Returns whether a new
    /// file landed on disk. Errors never escape: terminal failures are
    /// logged to the CSV failure log and counted.
    #[instrument(skip(self, item, m3u8_content), fields(url = %item.url, domain = %self.domain))]
    pub async fn run(&self, mut item: MediaItem, m3u8_content: &str) -> bool {
        self.env.state.wait_running().await;

        if self.was_processed_before(&item) {
            return false;
        }

        if !self.env.settings.runtime.ignore_history {
            match self
                .env
                .history
                .is_complete(&self.domain, item.url.as_str())
                .await
            {
                Ok(true) => {
                    debug!(url = %item.url, "skipping URL already complete in history");
                    self.env.stats.add_previously_completed();
                    return false;
                }
                Ok(false) => {}
                Err(db_error) => {
                    warn!(error = %db_error, "history lookup failed, downloading anyway");
                }
            }
        }

        // The incomplete mark must precede any network traffic.
        if let Err(db_error) = self.env.history.mark_incomplete(&self.domain, &item).await {
            self.write_download_error(&item, &db_error).await;
            return false;
        }

        self.processed_paths
            .insert(item.url.path().to_string(), ());

        let result = if m3u8_content.is_empty() {
            let permit = match self.env.fabric.download_limiter(&self.domain).await {
                Ok(permit) => permit,
                Err(_) => return false,
            };
            self.env.state.wait_running().await;
            info!("{} starting: {}", self.log_prefix, item.url);
            let _file_lock = self.env.locks.get_lock(&item.filename).await;
            let result = self.download_with_retry(&mut item).await;
            drop(permit);
            result
        } else {
            // HLS: segments take their own permits under the same domain
            // semaphore, so the parent must not hold one.
            info!("{} starting (HLS): {}", self.log_prefix, item.url);
            let _file_lock = self.env.locks.get_lock(&item.filename).await;
            self.download_hls(&mut item, m3u8_content).await
        };

        match result {
            Ok(downloaded) => downloaded,
            Err(error) => {
                self.write_download_error(&item, &error).await;
                false
            }
        }
    }

    fn was_processed_before(&self, item: &MediaItem) -> bool {
        self.processed_paths.contains_key(item.url.path())
            && !self.env.settings.runtime.ignore_history
    }

    /// Retry loop: consumes `Download(retry=true)` failures until the
    /// attempt ceiling. Status 999 signals progress-based retry and resets
    /// the counter instead of consuming an attempt.
    async fn download_with_retry(&self, item: &mut MediaItem) -> Result<bool, CdlError> {
        let max_attempts = self.env.settings.max_download_attempts();
        loop {
            let error = match self.download(item).await {
                Ok(downloaded) => return Ok(downloaded),
                Err(error) => self.map_transport_error(item, error),
            };

            match &error {
                CdlError::RestrictedFiletype { ext } => {
                    debug!(
                        url = %item.url,
                        ext = %ext,
                        "download skipped due to ignore_extension config"
                    );
                    self.env.stats.add_skipped();
                    return Ok(false);
                }
                CdlError::Download { retry: true, .. } => {
                    if error.is_progress_retry() {
                        item.current_attempt = 0;
                    } else {
                        item.current_attempt += 1;
                    }
                    warn!("{} failed: {} with error: {}", self.log_prefix, item.url, error);
                    if item.current_attempt < max_attempts {
                        info!(
                            "Retrying {}: {} , retry attempt: {}",
                            self.log_prefix.to_lowercase(),
                            item.url,
                            item.current_attempt + 1
                        );
                        self.env.stats.add_retried();
                        tokio::time::sleep(retry_delay()).await;
                        continue;
                    }
                    return Err(error);
                }
                _ => return Err(error),
            }
        }
    }

    /// One download attempt.
    async fn download(&self, item: &mut MediaItem) -> Result<bool, CdlError> {
        if let Some((_, status)) = KNOWN_BAD_URLS
            .iter()
            .find(|(url, _)| *url == item.url.as_str())
        {
            return Err(CdlError::download(*status, "known dead URL"));
        }

        self.env.state.wait_running().await;

        if !item.is_segment {
            if let Ok(duration) = self
                .env
                .history
                .get_duration(&self.domain, item.url.as_str())
                .await
            {
                if duration.is_some() {
                    item.duration = duration;
                }
            }
        }

        self.check_file_can_download(item).await?;

        if tokio::fs::try_exists(&item.complete_file())
            .await
            .unwrap_or(false)
        {
            debug!(file = %item.complete_file().display(), "complete file already on disk");
            if !item.is_segment {
                self.env.history.mark_complete(&self.domain, item).await?;
                self.env.stats.add_previously_completed();
            }
            return Ok(false);
        }

        let streamed = self.env.client.download_file(item).await?;
        self.finalize_download(item, streamed).await?;
        Ok(true)
    }

    /// Pre-flight checks: free space, extension class policy, duration
    /// policy.
    async fn check_file_can_download(&self, item: &MediaItem) -> Result<(), CdlError> {
        self.env.storage.check_free_space(item).await?;
        if !self.check_allowed_filetype(item) {
            return Err(CdlError::RestrictedFiletype {
                ext: item.ext.clone(),
            });
        }
        if let Some(duration) = item.duration {
            if !self.env.settings.ignore_options.duration_allowed(duration) {
                return Err(CdlError::Duration { seconds: duration });
            }
        }
        Ok(())
    }

    fn check_allowed_filetype(&self, item: &MediaItem) -> bool {
        use crate::items::FileKind;

        let ignore = &self.env.settings.ignore_options;
        match item.file_kind() {
            FileKind::Image => !ignore.exclude_images,
            FileKind::Video => !ignore.exclude_videos,
            FileKind::Audio => !ignore.exclude_audio,
            FileKind::Other => !ignore.exclude_other,
        }
    }

    /// Renames the partial into place, applies mode/timestamps, records
    /// completion, and runs the in-place hash hook.
    async fn finalize_download(
        &self,
        item: &mut MediaItem,
        streamed: StreamedBody,
    ) -> Result<(), CdlError> {
        let partial = item.partial_file();
        let complete = item.complete_file();
        let timestamp = item
            .published
            .filter(|_| !self.env.settings.download_options.disable_file_timestamps)
            .and_then(|secs| u64::try_from(secs).ok());

        let complete_for_task = complete.clone();
        let io_result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::rename(&partial, &complete_for_task)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(
                    &complete_for_task,
                    std::fs::Permissions::from_mode(0o666),
                )?;
            }
            if let Some(secs) = timestamp {
                let time = std::time::UNIX_EPOCH + Duration::from_secs(secs);
                let file = std::fs::File::options()
                    .write(true)
                    .open(&complete_for_task)?;
                file.set_times(
                    std::fs::FileTimes::new()
                        .set_accessed(time)
                        .set_modified(time),
                )?;
            }
            Ok(())
        })
        .await
        .map_err(|e| {
            CdlError::io(
                complete.clone(),
                std::io::Error::new(std::io::ErrorKind::Other, e),
            )
        })?;
        io_result.map_err(|e| CdlError::io(complete.clone(), e))?;

        self.current_attempt_filesize.remove(&item.filename);

        if !item.is_segment {
            self.env.history.mark_complete(&self.domain, item).await?;
            if let Some(hash) = self.env.hasher.hash_item_during_download(item).await {
                item.hash = Some(hash);
            }
            self.env.stats.add_completed();
            info!("Download finished: {} ({} bytes)", item.url, streamed.total_size);
        }
        Ok(())
    }

    /// Exception boundary: normalizes transport/filesystem failures into
    /// `Download` errors. When the partial file grew since the last attempt
    /// the failure becomes a progress retry (status 999) instead of
    /// consuming an attempt.
    fn map_transport_error(&self, item: &MediaItem, error: CdlError) -> CdlError {
        match error {
            CdlError::Http { .. } | CdlError::Io { .. } => {
                let label = error.ui_failure();
                if let Ok(metadata) = std::fs::metadata(item.partial_file()) {
                    let size = metadata.len();
                    let stalled = self
                        .current_attempt_filesize
                        .get(&item.filename)
                        .is_some_and(|previous| *previous >= size);
                    if stalled {
                        return CdlError::download_retry(
                            label,
                            format!("{} failed", self.log_prefix),
                        );
                    }
                    self.current_attempt_filesize
                        .insert(item.filename.clone(), size);
                    return CdlError::progress_retry();
                }
                CdlError::download_retry(label, error.to_string())
            }
            other => other,
        }
    }

    /// Terminal-failure bookkeeping: the `.part` file is retained, the URL
    /// stays incomplete in history, and one row lands in the failure log.
    async fn write_download_error(&self, item: &MediaItem, error: &CdlError) {
        error!(
            "{} Failed: {} ({}) \n -> Referer: {}",
            self.log_prefix, item.url, error, item.referer
        );
        self.env
            .failure_log
            .write_row(
                item.url.as_str(),
                item.referer.as_str(),
                &error.ui_failure(),
                &error.to_string(),
            )
            .await;
        self.env.stats.add_failed();
    }

    /// Downloads an HLS item: one task per segment through the same
    /// rate-limit and retry machinery, then ffmpeg concat.
    async fn download_hls(
        &self,
        item: &mut MediaItem,
        m3u8_content: &str,
    ) -> Result<bool, CdlError> {
        let Some(base) = item.debrid_link.clone() else {
            return Err(CdlError::download(
                "HLS Error",
                "media item has no playlist base URL",
            ));
        };
        if !hls::ffmpeg_available().await {
            return Err(CdlError::download(
                "FFmpeg Error",
                "FFmpeg is required for HLS downloads but is not available",
            ));
        }

        let segments = hls::create_segments(&base, m3u8_content)?;
        let n_segments = segments.len();
        let complete_file = item.complete_file();
        let segments_folder = complete_file.with_extension("temp");
        tokio::fs::create_dir_all(&segments_folder)
            .await
            .map_err(|e| CdlError::io(segments_folder.clone(), e))?;

        let mut segment_paths = Vec::with_capacity(n_segments);
        let mut tasks = Vec::with_capacity(n_segments);
        for segment in &segments {
            let mut seg_item = MediaItem::with_filename(
                segment.url.clone(),
                item.referer.clone(),
                segments_folder.clone(),
                &segment.custom_name,
            );
            // Segments keep the parent's extension for the filetype filter.
            seg_item.ext = item.ext.clone();
            seg_item.is_segment = true;
            segment_paths.push(seg_item.complete_file());
            tasks.push(self.download_segment(seg_item));
        }
        let results = futures_util::future::join_all(tasks).await;
        let n_successful = results.iter().filter(|ok| **ok).count();

        if n_successful != n_segments {
            return Err(CdlError::download(
                "HLS Seg Error",
                format!("Download of some segments failed. Successful: {n_successful}/{n_segments}"),
            ));
        }

        hls::concat_segments(&segment_paths, &complete_file).await?;
        let _ = tokio::fs::remove_dir_all(&segments_folder).await;

        self.env.history.mark_complete(&self.domain, item).await?;
        if let Some(hash) = self.env.hasher.hash_item_during_download(item).await {
            item.hash = Some(hash);
        }
        self.env.stats.add_completed();
        info!("Download finished: {} ({} segments)", item.url, n_segments);
        Ok(true)
    }

    /// Downloads one segment under its own download-limiter permit. A
    /// segment counts as successful when the download lands or the segment
    /// file already exists from a previous run.
    async fn download_segment(&self, mut seg_item: MediaItem) -> bool {
        let permit = match self.env.fabric.download_limiter(&self.domain).await {
            Ok(permit) => permit,
            Err(_) => return false,
        };
        let result = self.download_with_retry(&mut seg_item).await;
        drop(permit);
        match result {
            Ok(true) => true,
            Ok(false) => seg_item.complete_file().is_file(),
            Err(segment_error) => {
                debug!(
                    url = %seg_item.url,
                    error = %segment_error,
                    "segment download failed"
                );
                false
            }
        }
    }
}

fn retry_delay() -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=RETRY_MAX_JITTER_MS);
    RETRY_BASE_DELAY + Duration::from_millis(jitter)
}
