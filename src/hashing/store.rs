//! Durable content-hash index keyed by `(folder, filename, hash_type)`.

use std::path::{Path, PathBuf};

use sqlx::Row;

use crate::db::Database;
use crate::errors::CdlError;

/// Hash type always recorded for every hashed file.
pub const XXH128: &str = "xxh128";

/// Optional md5 hash type.
pub const MD5: &str = "md5";

/// Optional sha256 hash type.
pub const SHA256: &str = "sha256";

/// SQL operations over the `hashes` table.
#[derive(Debug, Clone)]
pub struct HashStore {
    db: Database,
}

impl HashStore {
    /// Creates a store over an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the recorded hash for `(path, hash_type)`, if any.
    ///
    /// # Errors
    ///
    /// Returns a database error when the query fails.
    pub async fn get_file_hash(
        &self,
        path: &Path,
        hash_type: &str,
    ) -> Result<Option<String>, CdlError> {
        let (folder, filename) = split_path(path);
        let row = sqlx::query(
            "SELECT hash FROM hashes WHERE folder = ? AND filename = ? AND hash_type = ?",
        )
        .bind(folder)
        .bind(filename)
        .bind(hash_type)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.map(|row| row.get::<String, _>("hash")))
    }

    /// Upserts a hash record.
    ///
    /// # Errors
    ///
    /// Returns a database error when the upsert fails.
    pub async fn insert_or_update(
        &self,
        hash: &str,
        hash_type: &str,
        path: &Path,
        size: u64,
        original_filename: Option<&str>,
        referer: Option<&str>,
    ) -> Result<(), CdlError> {
        let (folder, filename) = split_path(path);
        sqlx::query(
            "INSERT INTO hashes (folder, filename, size, hash_type, hash, original_filename, referer) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (folder, filename, hash_type) DO UPDATE SET \
               hash = excluded.hash, size = excluded.size, \
               original_filename = COALESCE(excluded.original_filename, original_filename), \
               referer = COALESCE(excluded.referer, referer)",
        )
        .bind(folder)
        .bind(filename)
        .bind(i64::try_from(size).unwrap_or(i64::MAX))
        .bind(hash_type)
        .bind(hash)
        .bind(original_filename)
        .bind(referer)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Every path recorded with this `(hash, size, hash_type)` triple, in
    /// insertion order. The order is what makes dedup's keep-the-first
    /// tie-break stable across runs.
    ///
    /// # Errors
    ///
    /// Returns a database error when the query fails.
    pub async fn files_with_hash(
        &self,
        hash: &str,
        size: u64,
        hash_type: &str,
    ) -> Result<Vec<PathBuf>, CdlError> {
        let rows = sqlx::query(
            "SELECT folder, filename FROM hashes \
             WHERE hash = ? AND size = ? AND hash_type = ? ORDER BY rowid",
        )
        .bind(hash)
        .bind(i64::try_from(size).unwrap_or(i64::MAX))
        .bind(hash_type)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                PathBuf::from(row.get::<String, _>("folder"))
                    .join(row.get::<String, _>("filename"))
            })
            .collect())
    }
}

fn split_path(path: &Path) -> (String, String) {
    let folder = path
        .parent()
        .map(|parent| parent.to_string_lossy().into_owned())
        .unwrap_or_default();
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    (folder, filename)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn store() -> HashStore {
        HashStore::new(Database::new_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let store = store().await;
        let path = Path::new("/dl/example/a.jpg");
        store
            .insert_or_update("abc123", XXH128, path, 100, Some("a.jpg"), None)
            .await
            .unwrap();
        assert_eq!(
            store.get_file_hash(path, XXH128).await.unwrap().as_deref(),
            Some("abc123")
        );
        assert!(store.get_file_hash(path, MD5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_preserves_original_filename() {
        let store = store().await;
        let path = Path::new("/dl/example/a.jpg");
        store
            .insert_or_update("abc", XXH128, path, 100, Some("orig.jpg"), Some("https://r"))
            .await
            .unwrap();
        store
            .insert_or_update("abc", XXH128, path, 100, None, None)
            .await
            .unwrap();
        let row = sqlx::query("SELECT original_filename, referer FROM hashes")
            .fetch_one(store.db.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<Option<String>, _>(0).as_deref(), Some("orig.jpg"));
        assert_eq!(row.get::<Option<String>, _>(1).as_deref(), Some("https://r"));
    }

    #[tokio::test]
    async fn test_files_with_hash_insertion_order() {
        let store = store().await;
        store
            .insert_or_update("h", XXH128, Path::new("/dl/b/2.jpg"), 100, None, None)
            .await
            .unwrap();
        store
            .insert_or_update("h", XXH128, Path::new("/dl/a/1.jpg"), 100, None, None)
            .await
            .unwrap();
        store
            .insert_or_update("h", XXH128, Path::new("/dl/c/3.jpg"), 999, None, None)
            .await
            .unwrap();

        let matches = store.files_with_hash("h", 100, XXH128).await.unwrap();
        // Insertion order, not path order; the size-999 row is excluded.
        assert_eq!(
            matches,
            vec![PathBuf::from("/dl/b/2.jpg"), PathBuf::from("/dl/a/1.jpg")]
        );
    }

    #[tokio::test]
    async fn test_hash_types_are_independent_rows() {
        let store = store().await;
        let path = Path::new("/dl/example/a.jpg");
        store
            .insert_or_update("xx", XXH128, path, 100, None, None)
            .await
            .unwrap();
        store
            .insert_or_update("md", MD5, path, 100, None, None)
            .await
            .unwrap();
        assert_eq!(
            store.get_file_hash(path, XXH128).await.unwrap().as_deref(),
            Some("xx")
        );
        assert_eq!(
            store.get_file_hash(path, MD5).await.unwrap().as_deref(),
            Some("md")
        );
    }
}
