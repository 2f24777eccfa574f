//! Cyberdrop-DL core library.
//!
//! A bulk media downloader: user-supplied URLs are expanded by per-site
//! extractors into media items, which a per-domain rate-limited downloader
//! fetches concurrently with resume, retry, and content-hash deduplication.
//!
//! # Architecture
//!
//! - [`limits`] - hierarchical rate-limit fabric (semaphores + token buckets)
//! - [`http`] - cookie-jar sessions, response cache, anti-bot bypass
//! - [`scrape`] - extractor registry and the scraping task group
//! - [`download`] - per-domain downloaders with retry/resume and HLS
//! - [`hashing`] - content-hash index and dedup cleanup
//! - [`storage`] - free-space monitor driving the RUNNING latch
//! - [`history`] - per-URL completion ledger
//! - [`db`] - SQLite pool shared by the history and hash stores

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod download;
pub mod errors;
pub mod failure_log;
pub mod hashing;
pub mod history;
pub mod http;
pub mod items;
pub mod limits;
pub mod progress;
pub mod scrape;
pub mod state;
pub mod storage;

// Re-export commonly used types
pub use config::{HashingMode, Settings};
pub use db::Database;
pub use download::{DownloadCoordinator, Downloader, DownloaderEnv, FileLocksVault};
pub use errors::{CdlError, FailureStatus, PROGRESS_RETRY_STATUS};
pub use failure_log::FailureLog;
pub use hashing::{HashClient, HashStore, XXH128};
pub use history::{HistoryRecord, HistoryStore};
pub use http::{
    DownloadClient, Flaresolverr, RequestOptions, ResponseCache, ScraperClient,
};
pub use items::{MediaItem, ScrapeItem, ScrapeItemKind};
pub use limits::{RateLimitFabric, TokenBucket};
pub use progress::RunStats;
pub use scrape::{Extractor, QueuedMedia, ScrapeContext, ScraperEngine};
pub use state::RunState;
pub use storage::StorageMonitor;
