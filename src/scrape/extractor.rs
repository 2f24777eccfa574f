//! The extractor capability and the context handed to running extractors.
//!
//! An extractor turns one [`ScrapeItem`] into media items handed to the
//! downloader and/or child scrape items scheduled as new tasks. Host-specific
//! modules implement [`Extractor`]; the engine owns scheduling and error
//! handling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::CdlError;
use crate::history::HistoryStore;
use crate::http::ScraperClient;
use crate::items::{MediaItem, ScrapeItem};

/// A media item queued for download, tagged with its extractor's domain.
#[derive(Debug)]
pub struct QueuedMedia {
    /// Canonical domain tag of the emitting extractor.
    pub domain: String,
    /// The file to download.
    pub media_item: MediaItem,
    /// Raw m3u8 index content for HLS items; empty for plain files.
    pub m3u8_content: String,
}

/// Per-site extractor capability.
///
/// `fetch` classifies the item's URL into one of the site's supported
/// shapes, fetches pages through the shared [`ScraperClient`], and emits
/// work through the [`ScrapeContext`].
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Canonical domain tag, also the rate-limit key (e.g. "bunkrr").
    fn primary_domain(&self) -> &'static str;

    /// Folder name used under the download directory.
    fn folder_domain(&self) -> &'static str {
        self.primary_domain()
    }

    /// Per-domain download-slot override.
    fn max_concurrent_downloads(&self) -> Option<usize> {
        None
    }

    /// Per-domain download spacer override (seconds).
    fn download_spacer(&self) -> Option<f64> {
        None
    }

    /// Per-domain request-rate override as `(rate, window)`. Domains
    /// without one use the well-known table or the "other" fallback.
    fn request_limit(&self) -> Option<(u32, Duration)> {
        None
    }

    /// Runs the extractor for one scrape item.
    async fn fetch(&self, ctx: &ScrapeContext, item: &mut ScrapeItem) -> Result<(), CdlError>;
}

/// Handles an extractor uses to fetch pages and emit work.
#[derive(Debug, Clone)]
pub struct ScrapeContext {
    /// Shared scraping session.
    pub client: Arc<ScraperClient>,
    /// History ledger (duration bookkeeping and completion checks).
    pub history: HistoryStore,
    /// Root download directory.
    pub download_folder: PathBuf,
    pub(crate) items_tx: mpsc::UnboundedSender<ScrapeItem>,
    pub(crate) media_tx: mpsc::UnboundedSender<QueuedMedia>,
}

impl ScrapeContext {
    /// Schedules a child scrape item as a new engine task, counting it
    /// against the parent's child limit.
    ///
    /// # Errors
    ///
    /// Returns [`CdlError::MaxChildren`] when the parent's limit is
    /// surpassed.
    pub fn spawn_child(&self, parent: &mut ScrapeItem, child: ScrapeItem) -> Result<(), CdlError> {
        parent.add_child()?;
        // The receiver outlives every extractor task; a send can only fail
        // during shutdown, which the engine treats as a drained queue.
        let _ = self.items_tx.send(child);
        Ok(())
    }

    /// Hands a plain media item to the downloader, counting it against the
    /// parent's child limit.
    ///
    /// # Errors
    ///
    /// Returns [`CdlError::MaxChildren`] when the parent's limit is
    /// surpassed.
    pub fn queue_media(
        &self,
        parent: &mut ScrapeItem,
        domain: &str,
        media_item: MediaItem,
    ) -> Result<(), CdlError> {
        parent.add_child()?;
        let _ = self.media_tx.send(QueuedMedia {
            domain: domain.to_string(),
            media_item,
            m3u8_content: String::new(),
        });
        Ok(())
    }

    /// Hands an HLS media item plus its m3u8 index to the downloader.
    ///
    /// # Errors
    ///
    /// Returns [`CdlError::MaxChildren`] when the parent's limit is
    /// surpassed.
    pub fn queue_hls(
        &self,
        parent: &mut ScrapeItem,
        domain: &str,
        media_item: MediaItem,
        m3u8_content: String,
    ) -> Result<(), CdlError> {
        parent.add_child()?;
        let _ = self.media_tx.send(QueuedMedia {
            domain: domain.to_string(),
            media_item,
            m3u8_content,
        });
        Ok(())
    }
}
