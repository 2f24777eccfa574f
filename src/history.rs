//! Per-URL completion ledger keyed by `(domain, url)`.
//!
//! The downloader marks an item incomplete before any network traffic and
//! complete only after the partial file has been renamed into place, so a
//! crash between the two leaves the URL incomplete and the `.part` file
//! resumable on the next run.

use sqlx::Row;
use tracing::instrument;

use crate::db::Database;
use crate::errors::CdlError;
use crate::items::MediaItem;

/// One row of the history ledger.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistoryRecord {
    /// Canonical domain tag of the owning extractor.
    pub domain: String,
    /// Source URL of the file.
    pub url: String,
    /// Referer recorded at download time.
    pub referer: Option<String>,
    /// Destination path of the completed file.
    pub download_path: Option<String>,
    /// 1 once the download finished and the file was renamed into place.
    pub completed: i64,
    /// Media duration in seconds when known.
    pub duration: Option<f64>,
}

/// History ledger operations used by the downloader and extractors.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    db: Database,
}

impl HistoryStore {
    /// Creates a store over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Marks a media item incomplete, creating the row if needed.
    ///
    /// # Errors
    ///
    /// Returns a database error when the upsert fails.
    #[instrument(level = "debug", skip(self, item), fields(url = %item.url))]
    pub async fn mark_incomplete(&self, domain: &str, item: &MediaItem) -> Result<(), CdlError> {
        sqlx::query(
            "INSERT INTO history (domain, url, referer, download_path, completed) \
             VALUES (?, ?, ?, ?, 0) \
             ON CONFLICT (domain, url) DO UPDATE SET completed = 0",
        )
        .bind(domain)
        .bind(item.url.as_str())
        .bind(item.referer.as_str())
        .bind(item.complete_file().to_string_lossy().into_owned())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Marks a media item complete, recording its destination path.
    ///
    /// # Errors
    ///
    /// Returns a database error when the upsert fails.
    #[instrument(level = "debug", skip(self, item), fields(url = %item.url))]
    pub async fn mark_complete(&self, domain: &str, item: &MediaItem) -> Result<(), CdlError> {
        sqlx::query(
            "INSERT INTO history (domain, url, referer, download_path, completed) \
             VALUES (?, ?, ?, ?, 1) \
             ON CONFLICT (domain, url) DO UPDATE SET \
               completed = 1, download_path = excluded.download_path, \
               referer = excluded.referer",
        )
        .bind(domain)
        .bind(item.url.as_str())
        .bind(item.referer.as_str())
        .bind(item.complete_file().to_string_lossy().into_owned())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Whether a URL is already marked complete.
    ///
    /// # Errors
    ///
    /// Returns a database error when the query fails.
    pub async fn is_complete(&self, domain: &str, url: &str) -> Result<bool, CdlError> {
        let row = sqlx::query("SELECT completed FROM history WHERE domain = ? AND url = ?")
            .bind(domain)
            .bind(url)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.is_some_and(|row| row.get::<i64, _>("completed") == 1))
    }

    /// Records a media duration for a URL (extractors call this when the
    /// site reports one).
    ///
    /// # Errors
    ///
    /// Returns a database error when the upsert fails.
    pub async fn set_duration(
        &self,
        domain: &str,
        url: &str,
        duration: f64,
    ) -> Result<(), CdlError> {
        sqlx::query(
            "INSERT INTO history (domain, url, completed, duration) VALUES (?, ?, 0, ?) \
             ON CONFLICT (domain, url) DO UPDATE SET duration = excluded.duration",
        )
        .bind(domain)
        .bind(url)
        .bind(duration)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Returns the recorded duration for a URL, if any.
    ///
    /// # Errors
    ///
    /// Returns a database error when the query fails.
    pub async fn get_duration(&self, domain: &str, url: &str) -> Result<Option<f64>, CdlError> {
        let row = sqlx::query("SELECT duration FROM history WHERE domain = ? AND url = ?")
            .bind(domain)
            .bind(url)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.and_then(|row| row.get::<Option<f64>, _>("duration")))
    }

    /// Fetches the full record for a URL (used by tests and status output).
    ///
    /// # Errors
    ///
    /// Returns a database error when the query fails.
    pub async fn get(&self, domain: &str, url: &str) -> Result<Option<HistoryRecord>, CdlError> {
        let record = sqlx::query_as::<_, HistoryRecord>(
            "SELECT domain, url, referer, download_path, completed, duration \
             FROM history WHERE domain = ? AND url = ?",
        )
        .bind(domain)
        .bind(url)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(record)
    }
}
