//! Scraper engine: extractor registry plus an unbounded task group turning
//! input URLs into a stream of media items for the downloader.
//!
//! Tasks may spawn more tasks (albums expand into files, profiles into
//! albums); the engine completes when the task group drains. Every extractor
//! call runs under an error-handling wrapper that converts structured errors
//! into tagged failure-log entries and never lets them escape the task.

pub mod extractor;
pub mod no_crawler;

pub use extractor::{Extractor, QueuedMedia, ScrapeContext};
pub use no_crawler::{NoCrawler, NO_CRAWLER_DOMAIN};

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::errors::CdlError;
use crate::failure_log::FailureLog;
use crate::history::HistoryStore;
use crate::http::ScraperClient;
use crate::items::ScrapeItem;
use crate::limits::RateLimitFabric;
use crate::progress::RunStats;

/// Extractor registry and task-group driver.
pub struct ScraperEngine {
    registry: DashMap<String, Arc<dyn Extractor>>,
    no_crawler: Arc<dyn Extractor>,
    client: Arc<ScraperClient>,
    history: HistoryStore,
    download_folder: PathBuf,
    failure_log: Arc<FailureLog>,
    stats: Arc<RunStats>,
}

impl ScraperEngine {
    /// Creates an engine with only the generic extractor registered.
    #[must_use]
    pub fn new(
        client: Arc<ScraperClient>,
        history: HistoryStore,
        download_folder: PathBuf,
        failure_log: Arc<FailureLog>,
        stats: Arc<RunStats>,
    ) -> Self {
        Self {
            registry: DashMap::new(),
            no_crawler: Arc::new(NoCrawler),
            client,
            history,
            download_folder,
            failure_log,
            stats,
        }
    }

    /// Registers an extractor and its rate/download limits with the fabric.
    /// Domains must be unique.
    pub fn register(&self, extractor: Arc<dyn Extractor>, fabric: &RateLimitFabric) {
        let domain = extractor.primary_domain();
        fabric.register_extractor(
            domain,
            extractor.download_spacer(),
            extractor.max_concurrent_downloads(),
        );
        if let Some((rate, window)) = extractor.request_limit() {
            fabric.register_limiter(domain, rate, window);
        }
        let previous = self.registry.insert(domain.to_string(), extractor);
        debug_assert!(previous.is_none(), "{domain} is already registered");
        debug!(domain, "extractor registered");
    }

    /// Resolves the extractor for a URL by host match, falling back to the
    /// generic extractor.
    #[must_use]
    pub fn extractor_for(&self, url: &Url) -> (String, Arc<dyn Extractor>) {
        let host = url.host_str().unwrap_or_default();
        for entry in &self.registry {
            if host.contains(entry.key()) {
                return (entry.key().clone(), Arc::clone(entry.value()));
            }
        }
        (NO_CRAWLER_DOMAIN.to_string(), Arc::clone(&self.no_crawler))
    }

    /// Runs the engine over the input URLs, pushing media items to
    /// `media_tx` as extractors emit them. Returns when the task group has
    /// drained.
    #[instrument(skip_all, fields(inputs = urls.len()))]
    pub async fn run(self: Arc<Self>, urls: Vec<Url>, media_tx: mpsc::UnboundedSender<QueuedMedia>) {
        let (items_tx, mut items_rx) = mpsc::unbounded_channel::<ScrapeItem>();
        let ctx = ScrapeContext {
            client: Arc::clone(&self.client),
            history: self.history.clone(),
            download_folder: self.download_folder.clone(),
            items_tx: items_tx.clone(),
            media_tx,
        };

        let mut next_task_id: u64 = 0;
        for url in urls {
            let mut item = ScrapeItem::new(url);
            next_task_id += 1;
            item.task_id = next_task_id;
            let _ = items_tx.send(item);
        }
        drop(items_tx);

        // Children are only sent from running tasks, and an unbounded send
        // lands in the queue before the sending task can complete. So once
        // the queue is drained and no task is running, the group is done.
        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            while let Ok(mut item) = items_rx.try_recv() {
                if item.task_id == 0 {
                    next_task_id += 1;
                    item.task_id = next_task_id;
                }
                let engine = Arc::clone(&self);
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    engine.process(&ctx, item).await;
                });
            }
            match tasks.join_next().await {
                Some(Ok(())) => {}
                Some(Err(join_error)) => {
                    warn!(error = %join_error, "scrape task panicked");
                }
                None => break,
            }
        }
        info!("scrape task group drained");
    }

    /// Error-handling wrapper around one extractor call.
    async fn process(&self, ctx: &ScrapeContext, mut item: ScrapeItem) {
        let (domain, extractor) = self.extractor_for(&item.url);
        let url = item.url.clone();
        debug!(%url, domain, task_id = item.task_id, "scrape task starting");

        match extractor.fetch(ctx, &mut item).await {
            Ok(()) => {}
            Err(CdlError::MaxChildren { limit }) => {
                // Non-fatal: emitted children keep going, further ones stop.
                warn!(%url, limit, "max children reached, remaining items skipped");
            }
            Err(
                error @ (CdlError::Scrape { .. }
                | CdlError::Login { .. }
                | CdlError::DdosGuard { .. }
                | CdlError::Download { .. }
                | CdlError::InvalidContentType { .. }
                | CdlError::RestrictedFiletype { .. }),
            ) => {
                error!(%url, domain, %error, "scrape failed");
                let referer = item.parents.last().map_or_else(
                    || url.to_string(),
                    ToString::to_string,
                );
                self.failure_log
                    .write_row(url.as_str(), &referer, &error.ui_failure(), &error.to_string())
                    .await;
                self.stats.add_scrape_failure();
            }
            Err(error) => {
                // Unexpected failure class: log with debug repr, abandon item.
                error!(%url, domain, error = ?error, "scrape task failed unexpectedly");
                self.failure_log
                    .write_row(url.as_str(), url.as_str(), &error.ui_failure(), &error.to_string())
                    .await;
                self.stats.add_scrape_failure();
            }
        }
    }
}
