//! URL-keyed on-disk response cache shared across scraper calls.
//!
//! Entries are stored one file per URL, named by the sha256 of the URL, with
//! the content type on the first line and the raw body after it. An
//! in-memory LRU index bounds the number of entries; the least recently used
//! entry file is removed when the capacity is exceeded.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::CdlError;

/// Default maximum number of cached responses.
const DEFAULT_CAPACITY: usize = 1024;

/// A cached response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    /// Content-Type header recorded at fetch time.
    pub content_type: String,
    /// Raw response body.
    pub body: Vec<u8>,
}

/// On-disk LRU response cache.
#[derive(Debug)]
pub struct ResponseCache {
    dir: PathBuf,
    capacity: usize,
    // Most recently used key at the back.
    order: Mutex<VecDeque<String>>,
}

impl ResponseCache {
    /// Opens (creating if needed) a cache rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the cache directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CdlError> {
        Self::with_capacity(dir, DEFAULT_CAPACITY)
    }

    /// Opens a cache with an explicit entry capacity.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the cache directory cannot be created.
    pub fn with_capacity(dir: impl Into<PathBuf>, capacity: usize) -> Result<Self, CdlError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| CdlError::io(dir.clone(), e))?;

        // Seed the LRU order from existing entries, oldest first.
        let mut existing: Vec<(std::time::SystemTime, String)> = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::UNIX_EPOCH);
                existing.push((modified, name));
            }
        }
        existing.sort();
        let order = existing.into_iter().map(|(_, name)| name).collect();

        Ok(Self {
            dir,
            capacity: capacity.max(1),
            order: Mutex::new(order),
        })
    }

    /// Looks up a URL, refreshing its LRU position on a hit.
    pub async fn get(&self, url: &str) -> Option<CachedResponse> {
        let key = cache_key(url);
        let path = self.dir.join(&key);
        let raw = tokio::fs::read(&path).await.ok()?;
        let split = raw.iter().position(|&b| b == b'\n')?;
        let content_type = String::from_utf8_lossy(&raw[..split]).into_owned();
        let body = raw[split + 1..].to_vec();

        let mut order = self.order.lock().await;
        order.retain(|k| k != &key);
        order.push_back(key);
        debug!(url, "response cache hit");
        Some(CachedResponse { content_type, body })
    }

    /// Stores a response, evicting the least recently used entry past
    /// capacity.
    pub async fn put(&self, url: &str, content_type: &str, body: &[u8]) {
        let key = cache_key(url);
        let path = self.dir.join(&key);

        let mut raw = Vec::with_capacity(content_type.len() + 1 + body.len());
        raw.extend_from_slice(content_type.as_bytes());
        raw.push(b'\n');
        raw.extend_from_slice(body);

        if let Err(error) = tokio::fs::write(&path, raw).await {
            warn!(url, %error, "failed to write response cache entry");
            return;
        }

        let evict = {
            let mut order = self.order.lock().await;
            order.retain(|k| k != &key);
            order.push_back(key);
            if order.len() > self.capacity {
                order.pop_front()
            } else {
                None
            }
        };
        if let Some(old_key) = evict {
            let _ = tokio::fs::remove_file(self.dir.join(old_key)).await;
        }
    }

    /// Removes a URL from the cache (challenge pages must not be replayed).
    pub async fn evict(&self, url: &str) {
        let key = cache_key(url);
        self.order.lock().await.retain(|k| k != &key);
        let _ = tokio::fs::remove_file(self.dir.join(key)).await;
    }

    /// Cache directory (test hook).
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn cache_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    format!("{:x}", hasher.finalize())
}
