//! Content-addressed post-processing: hashing completed downloads and
//! removing duplicates per policy.
//!
//! Every successfully hashed file gets at least an xxh128 record in the
//! durable index; md5/sha256 records exist when policy asks for them. After
//! hashing, dedup cleanup walks the in-memory `hash → size → paths` index,
//! queries the durable store for all matches (historical ones included),
//! keeps the first path in store order, and deletes the rest.

pub mod store;

pub use store::{HashStore, MD5, SHA256, XXH128};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use md5::Md5;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};
use xxhash_rust::xxh3::Xxh3;

use crate::config::{HashingMode, Settings};
use crate::errors::CdlError;
use crate::items::MediaItem;
use crate::progress::RunStats;

/// Read size for streaming hash computation.
const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// Hash engine and in-memory dedup index.
#[derive(Debug)]
pub struct HashClient {
    store: HashStore,
    mode: HashingMode,
    add_md5: bool,
    add_sha256: bool,
    auto_dedupe: bool,
    send_deleted_to_trash: bool,
    ignore_history: bool,
    stats: Arc<RunStats>,
    hashes: Mutex<HashMap<String, BTreeMap<u64, BTreeSet<PathBuf>>>>,
}

impl HashClient {
    /// Creates a hash client from the dedup policy.
    #[must_use]
    pub fn new(store: HashStore, settings: &Settings, stats: Arc<RunStats>) -> Self {
        let options = &settings.dupe_cleanup;
        Self {
            store,
            mode: options.hashing,
            add_md5: options.add_md5_hash,
            add_sha256: options.add_sha256_hash,
            auto_dedupe: options.auto_dedupe,
            send_deleted_to_trash: options.send_deleted_to_trash,
            ignore_history: settings.runtime.ignore_history,
            stats,
            hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Configured hashing mode.
    #[must_use]
    pub fn mode(&self) -> HashingMode {
        self.mode
    }

    /// Hashes a completed media item and records it in the dedup index.
    ///
    /// # Errors
    ///
    /// Returns database and IO errors from hashing or record upserts.
    pub async fn hash_item(&self, item: &MediaItem) -> Result<Option<String>, CdlError> {
        let hash = self
            .update_db_and_retrieve_hash(
                &item.complete_file(),
                Some(item.original_filename.as_str()),
                Some(item.referer.as_str()),
            )
            .await?;
        if let Some(hash) = &hash {
            self.save_hash_data(&item.complete_file(), hash).await;
        }
        Ok(hash)
    }

    /// In-place hook called right after a download completes. Only active
    /// in [`HashingMode::InPlace`]; failures are logged, never propagated.
    /// Returns the xxh128 hash when one was computed so the caller can
    /// record it on the media item.
    pub async fn hash_item_during_download(&self, item: &MediaItem) -> Option<String> {
        if self.mode != HashingMode::InPlace {
            return None;
        }
        match self.hash_item(item).await {
            Ok(hash) => hash,
            Err(hash_error) => {
                error!(
                    file = %item.complete_file().display(),
                    error = %hash_error,
                    "after-download hash processing failed"
                );
                None
            }
        }
    }

    /// Post-run pass over all completed items.
    pub async fn hash_completed_items(&self, items: &[MediaItem]) {
        if self.mode == HashingMode::Off {
            return;
        }
        for item in items {
            if item.is_segment {
                continue;
            }
            if let Err(hash_error) = self.hash_item(item).await {
                error!(
                    file = %item.complete_file().display(),
                    error = %hash_error,
                    "unable to hash file"
                );
            }
        }
    }

    /// Hashes a file and upserts records for every enabled hash type,
    /// returning the xxh128 hash. Non-files, empty files, and `.part`
    /// files are skipped.
    ///
    /// # Errors
    ///
    /// Returns database and IO errors.
    pub async fn update_db_and_retrieve_hash(
        &self,
        file: &Path,
        original_filename: Option<&str>,
        referer: Option<&str>,
    ) -> Result<Option<String>, CdlError> {
        let Ok(metadata) = tokio::fs::metadata(file).await else {
            return Ok(None);
        };
        if !metadata.is_file() || metadata.len() == 0 {
            return Ok(None);
        }
        if file.extension().is_some_and(|ext| ext == "part") {
            return Ok(None);
        }

        let size = metadata.len();
        let hash = self
            .hash_with_type(file, size, original_filename, referer, XXH128)
            .await?;
        if self.add_md5 {
            self.hash_with_type(file, size, original_filename, referer, MD5)
                .await?;
        }
        if self.add_sha256 {
            self.hash_with_type(file, size, original_filename, referer, SHA256)
                .await?;
        }
        Ok(Some(hash))
    }

    async fn hash_with_type(
        &self,
        file: &Path,
        size: u64,
        original_filename: Option<&str>,
        referer: Option<&str>,
        hash_type: &str,
    ) -> Result<String, CdlError> {
        let hash = match self.store.get_file_hash(file, hash_type).await? {
            Some(known) => {
                self.stats.add_previously_hashed();
                known
            }
            None => {
                let computed = hash_file(file, hash_type).await?;
                self.stats.add_hashed();
                computed
            }
        };
        self.store
            .insert_or_update(&hash, hash_type, file, size, original_filename, referer)
            .await?;
        Ok(hash)
    }

    async fn save_hash_data(&self, path: &Path, hash: &str) {
        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let size = tokio::fs::metadata(&absolute)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        let mut hashes = self.hashes.lock().await;
        hashes
            .entry(hash.to_string())
            .or_default()
            .entry(size)
            .or_default()
            .insert(absolute);
    }

    /// Removes duplicate files after hashing. For each `(hash, size)` group
    /// the durable index supplies all known paths in insertion order; the
    /// first is kept and every later one that still exists is deleted.
    /// Returns the number of removed files.
    ///
    /// # Errors
    ///
    /// Returns database errors from the match queries; individual deletion
    /// failures are logged and skipped.
    #[instrument(skip(self))]
    pub async fn cleanup_dupes(&self) -> Result<usize, CdlError> {
        if self.mode == HashingMode::Off || !self.auto_dedupe || self.ignore_history {
            return Ok(0);
        }

        let snapshot = self.hashes.lock().await.clone();
        let mut removed = 0usize;
        for (hash, sizes) in &snapshot {
            for size in sizes.keys() {
                let matches = self.store.files_with_hash(hash, *size, XXH128).await?;
                for file in matches.iter().skip(1) {
                    if !file.is_file() {
                        continue;
                    }
                    match self.delete_file(file).await {
                        Ok(()) => {
                            debug!(file = %file.display(), %hash, "removed duplicate download");
                            self.stats.add_removed_file();
                            removed += 1;
                        }
                        Err(delete_error) => {
                            error!(
                                file = %file.display(),
                                %hash,
                                error = %delete_error,
                                "unable to remove duplicate"
                            );
                        }
                    }
                }
            }
        }
        if removed > 0 {
            info!(removed, "dedup cleanup finished");
        }
        Ok(removed)
    }

    async fn delete_file(&self, path: &Path) -> Result<(), CdlError> {
        let path = path.to_path_buf();
        if self.send_deleted_to_trash {
            let trash_path = path.clone();
            tokio::task::spawn_blocking(move || trash::delete(&trash_path))
                .await
                .map_err(|e| {
                    CdlError::io(path.clone(), std::io::Error::new(std::io::ErrorKind::Other, e))
                })?
                .map_err(|e| {
                    CdlError::io(path.clone(), std::io::Error::new(std::io::ErrorKind::Other, e))
                })
        } else {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| CdlError::io(path, e))
        }
    }

    /// Snapshot of the in-memory index (tests assert over this).
    pub async fn hashes_snapshot(&self) -> HashMap<String, BTreeMap<u64, BTreeSet<PathBuf>>> {
        self.hashes.lock().await.clone()
    }
}

/// Streams a file through the named hash off the event loop.
///
/// # Errors
///
/// Returns IO errors from reading the file.
pub async fn hash_file(path: &Path, hash_type: &str) -> Result<String, CdlError> {
    let path = path.to_path_buf();
    let hash_type = hash_type.to_string();
    let result_path = path.clone();
    tokio::task::spawn_blocking(move || compute_hash_blocking(&path, &hash_type))
        .await
        .map_err(|e| {
            CdlError::io(
                result_path.clone(),
                std::io::Error::new(std::io::ErrorKind::Other, e),
            )
        })?
        .map_err(|e| CdlError::io(result_path, e))
}

fn compute_hash_blocking(path: &Path, hash_type: &str) -> std::io::Result<String> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    match hash_type {
        MD5 => {
            let mut hasher = Md5::new();
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }
            Ok(hex_string(&hasher.finalize()))
        }
        SHA256 => {
            let mut hasher = Sha256::new();
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }
            Ok(hex_string(&hasher.finalize()))
        }
        _ => {
            let mut hasher = Xxh3::new();
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }
            Ok(format!("{:032x}", hasher.digest128()))
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn client(settings: &Settings) -> HashClient {
        let store = HashStore::new(Database::new_in_memory().await.unwrap());
        HashClient::new(store, settings, Arc::new(RunStats::new()))
    }

    fn media_item(folder: &Path, name: &str) -> MediaItem {
        let url: url::Url = format!("https://example.host/{name}").parse().unwrap();
        MediaItem::new(url.clone(), url, folder.to_path_buf())
    }

    #[tokio::test]
    async fn test_hash_file_xxh128_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let first = hash_file(&path, XXH128).await.unwrap();
        let second = hash_file(&path, XXH128).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32, "xxh128 digests render as 32 hex chars");
    }

    #[tokio::test]
    async fn test_hash_file_types_differ() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let xxh = hash_file(&path, XXH128).await.unwrap();
        let md5 = hash_file(&path, MD5).await.unwrap();
        let sha = hash_file(&path, SHA256).await.unwrap();
        assert_ne!(xxh, md5);
        assert_ne!(md5, sha);
        assert_eq!(md5, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(
            sha,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn test_part_and_empty_files_are_skipped() {
        let settings = Settings::default();
        let client = client(&settings).await;
        let dir = tempfile::tempdir().unwrap();

        let partial = dir.path().join("a.jpg.part");
        std::fs::write(&partial, b"half").unwrap();
        assert!(client
            .update_db_and_retrieve_hash(&partial, None, None)
            .await
            .unwrap()
            .is_none());

        let empty = dir.path().join("empty.jpg");
        std::fs::write(&empty, b"").unwrap();
        assert!(client
            .update_db_and_retrieve_hash(&empty, None, None)
            .await
            .unwrap()
            .is_none());

        assert!(client
            .update_db_and_retrieve_hash(&dir.path().join("missing.jpg"), None, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_known_hash_is_reused() {
        let settings = Settings::default();
        let client = client(&settings).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"content").unwrap();

        client
            .store
            .insert_or_update("precomputed", XXH128, &path, 7, None, None)
            .await
            .unwrap();
        let hash = client
            .update_db_and_retrieve_hash(&path, None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hash, "precomputed");
        assert_eq!(client.stats.previously_hashed(), 1);
        assert_eq!(client.stats.hashed(), 0);
    }

    #[tokio::test]
    async fn test_md5_records_added_when_enabled() {
        let mut settings = Settings::default();
        settings.dupe_cleanup.add_md5_hash = true;
        let client = client(&settings).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jpg");
        std::fs::write(&path, b"hello world").unwrap();

        client
            .update_db_and_retrieve_hash(&path, None, None)
            .await
            .unwrap();
        assert!(client.store.get_file_hash(&path, XXH128).await.unwrap().is_some());
        assert_eq!(
            client.store.get_file_hash(&path, MD5).await.unwrap().as_deref(),
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3")
        );
        assert!(client.store.get_file_hash(&path, SHA256).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_place_hook_returns_hash_and_records_it() {
        let mut settings = Settings::default();
        settings.dupe_cleanup.hashing = HashingMode::InPlace;
        let client = client(&settings).await;

        let dir = tempfile::tempdir().unwrap();
        let item = media_item(dir.path(), "a.jpg");
        std::fs::write(item.complete_file(), b"payload").unwrap();

        let hash = client.hash_item_during_download(&item).await.unwrap();
        assert_eq!(
            client
                .store
                .get_file_hash(&item.complete_file(), XXH128)
                .await
                .unwrap()
                .as_deref(),
            Some(hash.as_str())
        );
        assert!(client.hashes_snapshot().await.contains_key(&hash));
    }

    #[tokio::test]
    async fn test_in_place_hook_inactive_in_other_modes() {
        let mut settings = Settings::default();
        settings.dupe_cleanup.hashing = HashingMode::PostRun;
        let client = client(&settings).await;

        let dir = tempfile::tempdir().unwrap();
        let item = media_item(dir.path(), "a.jpg");
        std::fs::write(item.complete_file(), b"payload").unwrap();

        assert!(client.hash_item_during_download(&item).await.is_none());
        assert!(client
            .store
            .get_file_hash(&item.complete_file(), XXH128)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_in_place_hook_swallows_missing_file() {
        let mut settings = Settings::default();
        settings.dupe_cleanup.hashing = HashingMode::InPlace;
        let client = client(&settings).await;

        let dir = tempfile::tempdir().unwrap();
        let item = media_item(dir.path(), "never-downloaded.jpg");
        assert!(client.hash_item_during_download(&item).await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_removes_later_duplicates() {
        let mut settings = Settings::default();
        settings.dupe_cleanup.send_deleted_to_trash = false;
        let client = client(&settings).await;

        let dir = tempfile::tempdir().unwrap();
        let folder_a = dir.path().join("a");
        let folder_b = dir.path().join("b");
        std::fs::create_dir_all(&folder_a).unwrap();
        std::fs::create_dir_all(&folder_b).unwrap();
        let first = media_item(&folder_a, "first.jpg");
        let second = media_item(&folder_b, "second.jpg");
        std::fs::write(first.complete_file(), b"same bytes").unwrap();
        std::fs::write(second.complete_file(), b"same bytes").unwrap();

        client.hash_item(&first).await.unwrap();
        client.hash_item(&second).await.unwrap();

        let removed = client.cleanup_dupes().await.unwrap();
        assert_eq!(removed, 1);
        // First-inserted path wins, deterministically.
        assert!(first.complete_file().exists());
        assert!(!second.complete_file().exists());
        assert_eq!(client.stats.removed_files(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_disabled_by_policy() {
        let mut settings = Settings::default();
        settings.dupe_cleanup.auto_dedupe = false;
        let client = client(&settings).await;
        assert_eq!(client.cleanup_dupes().await.unwrap(), 0);

        let mut settings = Settings::default();
        settings.runtime.ignore_history = true;
        let client = super::HashClient::new(
            HashStore::new(Database::new_in_memory().await.unwrap()),
            &settings,
            Arc::new(RunStats::new()),
        );
        assert_eq!(client.cleanup_dupes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_different_content_is_not_deduped() {
        let mut settings = Settings::default();
        settings.dupe_cleanup.send_deleted_to_trash = false;
        let client = client(&settings).await;

        let dir = tempfile::tempdir().unwrap();
        let first = media_item(dir.path(), "first.jpg");
        let second = media_item(dir.path(), "second.jpg");
        std::fs::write(first.complete_file(), b"alpha").unwrap();
        std::fs::write(second.complete_file(), b"bravo").unwrap();

        client.hash_item(&first).await.unwrap();
        client.hash_item(&second).await.unwrap();
        assert_eq!(client.cleanup_dupes().await.unwrap(), 0);
        assert!(first.complete_file().exists());
        assert!(second.complete_file().exists());
    }

    #[tokio::test]
    async fn test_index_matches_store_for_existing_paths() {
        let mut settings = Settings::default();
        settings.dupe_cleanup.send_deleted_to_trash = false;
        let client = client(&settings).await;

        let dir = tempfile::tempdir().unwrap();
        let item = media_item(dir.path(), "a.jpg");
        std::fs::write(item.complete_file(), b"payload").unwrap();
        let hash = client.hash_item(&item).await.unwrap().unwrap();

        let snapshot = client.hashes_snapshot().await;
        let by_size = snapshot.get(&hash).unwrap();
        let paths = by_size.get(&7).unwrap();
        let store_paths = client.store.files_with_hash(&hash, 7, XXH128).await.unwrap();
        assert_eq!(
            paths.iter().cloned().collect::<Vec<_>>(),
            store_paths,
            "in-memory index and durable store must agree"
        );
    }
}
