//! Database connection and schema management.
//!
//! SQLite connectivity for the history ledger and hash index:
//! - connection pool management
//! - WAL mode for concurrent reads
//! - automatic migration execution

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Default maximum number of connections in the pool.
/// Kept low for SQLite since it uses file-level locking.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// SQLite busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to run migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Database connection wrapper with connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Creates a new database connection to the specified path.
    ///
    /// Creates the file if missing, enables WAL mode, and runs pending
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Connection` if the connection fails,
    /// or `DbError::Migration` if migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Gracefully closes all connections in the pool.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_new_in_memory_succeeds() {
        let db = Database::new_in_memory().await;
        assert!(db.is_ok(), "Failed to create in-memory database");
    }

    #[tokio::test]
    async fn test_history_table_exists_after_migration() {
        let db = Database::new_in_memory().await.unwrap();
        let result = sqlx::query(
            "INSERT INTO history (domain, url, completed) VALUES ('example', 'https://example.host/a.jpg', 0)",
        )
        .execute(db.pool())
        .await;
        assert!(result.is_ok(), "history table should exist: {result:?}");
    }

    #[tokio::test]
    async fn test_hashes_table_exists_after_migration() {
        let db = Database::new_in_memory().await.unwrap();
        let result = sqlx::query(
            "INSERT INTO hashes (folder, filename, size, hash_type, hash) \
             VALUES ('/dl', 'a.jpg', 100, 'xxh128', 'deadbeef')",
        )
        .execute(db.pool())
        .await;
        assert!(result.is_ok(), "hashes table should exist: {result:?}");
    }

    #[tokio::test]
    async fn test_history_completed_check_constraint() {
        let db = Database::new_in_memory().await.unwrap();
        let result = sqlx::query(
            "INSERT INTO history (domain, url, completed) VALUES ('example', 'https://x/a', 7)",
        )
        .execute(db.pool())
        .await;
        assert!(result.is_err(), "completed outside 0/1 must be rejected");
    }

    #[tokio::test]
    async fn test_database_with_tempfile_enables_wal() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path).await.unwrap();

        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(mode.0.to_lowercase(), "wal");
    }
}
