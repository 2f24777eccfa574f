//! Hierarchical rate-limit fabric shared by every outbound HTTP call.
//!
//! Three nested scopes admit a request:
//! 1. a global concurrent-request semaphore (fixed cap),
//! 2. a global request token bucket,
//! 3. a per-domain token bucket (well-known domains get specific
//!    rate/window pairs, unknown domains fall back to "other").
//!
//! Downloads go through an analogous triple: the global download semaphore,
//! a per-domain download semaphore (overridable per extractor), and a
//! per-domain pre-sleep spacer applied before acquisition.
//!
//! All acquisitions are RAII guards, so cancellation at any suspension point
//! releases every gate that was already held.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::config::RateLimitingOptions;
use crate::errors::CdlError;

/// Global ceiling on concurrent HTTP requests.
const GLOBAL_REQUEST_SEMAPHORE_LIMIT: usize = 50;

/// Default spacer (seconds) for domains without a registered value.
const DEFAULT_DOWNLOAD_SPACER: f64 = 0.1;

/// Well-known per-domain request limits as (domain, rate, window seconds).
const REQUEST_LIMITS: &[(&str, u32, u64)] = &[
    ("bunkrr", 5, 1),
    ("cyberdrop", 5, 1),
    ("coomer", 1, 1),
    ("kemono", 1, 1),
    ("pixeldrain", 10, 1),
    ("gofile", 100, 60),
    ("other", 25, 1),
];

/// Well-known per-domain download spacers in seconds.
const DOWNLOAD_SPACERS: &[(&str, f64)] = &[
    ("bunkr", 0.5),
    ("bunkrr", 0.5),
    ("cyberdrop", 0.0),
    ("cyberfile", 0.0),
    ("pixeldrain", 0.0),
    ("coomer", 0.5),
    ("kemono", 0.5),
];

/// Token bucket admitting at most `rate` acquisitions per sliding `window`.
///
/// Waiters queue on an internal mutex, so admission order is FIFO per
/// bucket. The level "leaks" continuously: after a full idle window the
/// bucket is empty again.
#[derive(Debug)]
pub struct TokenBucket {
    rate: u32,
    window: Duration,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    level: f64,
    last: Instant,
}

impl TokenBucket {
    /// Creates a bucket admitting `rate` acquisitions per `window`.
    #[must_use]
    pub fn new(rate: u32, window: Duration) -> Self {
        Self {
            rate: rate.max(1),
            window,
            state: Mutex::new(BucketState {
                level: 0.0,
                last: Instant::now(),
            }),
        }
    }

    /// Waits until the bucket admits one acquisition.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last.elapsed().as_secs_f64();
                let leaked = elapsed / self.window.as_secs_f64() * f64::from(self.rate);
                state.level = (state.level - leaked).max(0.0);
                state.last = Instant::now();

                if state.level + 1.0 <= f64::from(self.rate) {
                    state.level += 1.0;
                    return;
                }
                let deficit = state.level + 1.0 - f64::from(self.rate);
                Duration::from_secs_f64(
                    deficit * self.window.as_secs_f64() / f64::from(self.rate),
                )
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// RAII guard over the request triple. Dropping releases the global
/// semaphore slot; token-bucket admissions are consumed, not held.
#[derive(Debug)]
pub struct RequestPermit {
    _global: OwnedSemaphorePermit,
}

/// RAII guard over the download triple plus the request triple.
#[derive(Debug)]
pub struct DownloadPermit {
    _domain: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
    _request: RequestPermit,
}

/// Shared rate-limit fabric. Registries are populated at startup
/// (well-known tables plus per-extractor registration); reads dominate.
#[derive(Debug)]
pub struct RateLimitFabric {
    global_request_semaphore: Arc<Semaphore>,
    global_request_limiter: TokenBucket,
    request_limiters: DashMap<String, Arc<TokenBucket>>,
    download_spacers: DashMap<String, f64>,
    download_semaphores: DashMap<String, Arc<Semaphore>>,
    default_download_semaphore: Arc<Semaphore>,
    global_download_semaphore: Arc<Semaphore>,
    global_download_delay: f64,
}

impl RateLimitFabric {
    /// Builds the fabric from rate-limiting options, seeding the well-known
    /// domain tables.
    #[must_use]
    pub fn new(options: &RateLimitingOptions) -> Self {
        let request_limiters = DashMap::new();
        for (domain, rate, window) in REQUEST_LIMITS {
            request_limiters.insert(
                (*domain).to_string(),
                Arc::new(TokenBucket::new(*rate, Duration::from_secs(*window))),
            );
        }
        let download_spacers = DashMap::new();
        for (domain, spacer) in DOWNLOAD_SPACERS {
            download_spacers.insert((*domain).to_string(), *spacer);
        }

        Self {
            global_request_semaphore: Arc::new(Semaphore::new(GLOBAL_REQUEST_SEMAPHORE_LIMIT)),
            global_request_limiter: TokenBucket::new(
                options.rate_limit.max(1),
                Duration::from_secs(1),
            ),
            request_limiters,
            download_spacers,
            download_semaphores: DashMap::new(),
            default_download_semaphore: Arc::new(Semaphore::new(
                options.max_simultaneous_downloads_per_domain.max(1),
            )),
            global_download_semaphore: Arc::new(Semaphore::new(
                options.max_simultaneous_downloads.max(1),
            )),
            global_download_delay: options.download_delay,
        }
    }

    /// Registers an extractor's download overrides. Domains must be unique.
    pub fn register_extractor(
        &self,
        domain: &str,
        spacer: Option<f64>,
        max_concurrent_downloads: Option<usize>,
    ) {
        if let Some(spacer) = spacer {
            self.download_spacers.insert(domain.to_string(), spacer);
        }
        if let Some(slots) = max_concurrent_downloads {
            self.download_semaphores
                .insert(domain.to_string(), Arc::new(Semaphore::new(slots.max(1))));
        }
        debug!(domain, ?spacer, ?max_concurrent_downloads, "registered extractor limits");
    }

    /// Registers a request limiter for a domain (startup only; extractors
    /// with a [`request_limit`](crate::scrape::Extractor::request_limit)
    /// override land here).
    pub fn register_limiter(&self, domain: &str, rate: u32, window: Duration) {
        self.request_limiters
            .insert(domain.to_string(), Arc::new(TokenBucket::new(rate, window)));
    }

    /// Returns the request limiter for a domain, falling back to "other".
    #[must_use]
    pub fn request_limiter(&self, domain: &str) -> Arc<TokenBucket> {
        if let Some(limiter) = self.request_limiters.get(domain) {
            return Arc::clone(&limiter);
        }
        self.request_limiters
            .entry("other".to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(25, Duration::from_secs(1))))
            .clone()
    }

    /// Returns the download spacer for a domain (seconds).
    #[must_use]
    pub fn download_spacer(&self, domain: &str) -> f64 {
        self.download_spacers
            .get(domain)
            .map_or(DEFAULT_DOWNLOAD_SPACER, |spacer| *spacer)
    }

    /// Returns the per-domain download semaphore.
    #[must_use]
    pub fn download_semaphore(&self, domain: &str) -> Arc<Semaphore> {
        self.download_semaphores
            .get(domain)
            .map_or_else(|| Arc::clone(&self.default_download_semaphore), |s| Arc::clone(&s))
    }

    /// Acquires the request triple for a domain.
    ///
    /// Returns only once all three gates admit; dropping the permit releases
    /// the semaphore slot on every exit path, including cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`CdlError::Shutdown`] when the gates are closed under a
    /// waiter during shutdown.
    #[instrument(level = "debug", skip(self))]
    pub async fn limiter(&self, domain: &str) -> Result<RequestPermit, CdlError> {
        let global = Arc::clone(&self.global_request_semaphore)
            .acquire_owned()
            .await
            .map_err(|_| CdlError::Shutdown)?;
        self.global_request_limiter.acquire().await;
        self.request_limiter(domain).acquire().await;
        Ok(RequestPermit { _global: global })
    }

    /// Acquires the download triple for a domain, sleeping
    /// `global_download_delay + spacer(domain)` first.
    ///
    /// # Errors
    ///
    /// Returns [`CdlError::Shutdown`] when the gates are closed under a
    /// waiter during shutdown.
    #[instrument(level = "debug", skip(self))]
    pub async fn download_limiter(&self, domain: &str) -> Result<DownloadPermit, CdlError> {
        let spacer = self.download_spacer(domain);
        let delay = self.global_download_delay + spacer;
        if delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        let domain_permit = self
            .download_semaphore(domain)
            .acquire_owned()
            .await
            .map_err(|_| CdlError::Shutdown)?;
        let global_permit = Arc::clone(&self.global_download_semaphore)
            .acquire_owned()
            .await
            .map_err(|_| CdlError::Shutdown)?;
        let request = self.limiter(domain).await?;
        Ok(DownloadPermit {
            _domain: domain_permit,
            _global: global_permit,
            _request: request,
        })
    }

    /// Number of free slots on the global download semaphore (test hook and
    /// status logging).
    #[must_use]
    pub fn available_download_slots(&self) -> usize {
        self.global_download_semaphore.available_permits()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fabric() -> RateLimitFabric {
        RateLimitFabric::new(&RateLimitingOptions::default())
    }

    #[tokio::test]
    async fn test_token_bucket_burst_within_rate_is_immediate() {
        tokio::time::pause();
        let bucket = TokenBucket::new(5, Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..5 {
            bucket.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_token_bucket_delays_past_rate() {
        tokio::time::pause();
        let bucket = TokenBucket::new(2, Duration::from_secs(1));
        let start = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        // Third acquisition needs half a window to leak one slot.
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(450));
        assert!(start.elapsed() <= Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_token_bucket_refills_after_idle_window() {
        tokio::time::pause();
        let bucket = TokenBucket::new(2, Duration::from_secs(1));
        bucket.acquire().await;
        bucket.acquire().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let start = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn test_request_limiter_known_domain() {
        let fabric = fabric();
        // Known domains get their own bucket, distinct from "other".
        let coomer = fabric.request_limiter("coomer");
        let other = fabric.request_limiter("other");
        assert!(!Arc::ptr_eq(&coomer, &other));
    }

    #[test]
    fn test_request_limiter_unknown_domain_falls_back_to_other() {
        let fabric = fabric();
        let unknown = fabric.request_limiter("example");
        let other = fabric.request_limiter("other");
        assert!(Arc::ptr_eq(&unknown, &other));
    }

    #[test]
    fn test_download_spacer_defaults() {
        let fabric = fabric();
        assert!((fabric.download_spacer("bunkr") - 0.5).abs() < f64::EPSILON);
        assert!((fabric.download_spacer("cyberdrop") - 0.0).abs() < f64::EPSILON);
        assert!((fabric.download_spacer("example") - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_register_extractor_overrides() {
        let fabric = fabric();
        fabric.register_extractor("example", Some(0.25), Some(2));
        assert!((fabric.download_spacer("example") - 0.25).abs() < f64::EPSILON);
        let semaphore = fabric.download_semaphore("example");
        assert_eq!(semaphore.available_permits(), 2);
    }

    #[test]
    fn test_register_limiter_overrides_other_fallback() {
        let fabric = fabric();
        let before = fabric.request_limiter("example");
        let other = fabric.request_limiter("other");
        assert!(Arc::ptr_eq(&before, &other));

        fabric.register_limiter("example", 2, Duration::from_secs(1));
        let after = fabric.request_limiter("example");
        assert!(!Arc::ptr_eq(&after, &other));
    }

    #[tokio::test]
    async fn test_registered_limiter_enforces_its_rate() {
        tokio::time::pause();
        let fabric = fabric();
        fabric.register_limiter("example", 1, Duration::from_secs(1));

        let limiter = fabric.request_limiter("example");
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn test_download_semaphore_default_slots() {
        let options = RateLimitingOptions {
            max_simultaneous_downloads_per_domain: 4,
            ..RateLimitingOptions::default()
        };
        let fabric = RateLimitFabric::new(&options);
        assert_eq!(fabric.download_semaphore("example").available_permits(), 4);
    }

    #[tokio::test]
    async fn test_limiter_releases_global_slot_on_drop() {
        let fabric = fabric();
        let before = fabric.global_request_semaphore.available_permits();
        {
            let _permit = fabric.limiter("example").await.unwrap();
            assert_eq!(
                fabric.global_request_semaphore.available_permits(),
                before - 1
            );
        }
        assert_eq!(fabric.global_request_semaphore.available_permits(), before);
    }

    #[tokio::test]
    async fn test_download_limiter_holds_both_semaphores() {
        tokio::time::pause();
        let options = RateLimitingOptions {
            max_simultaneous_downloads: 2,
            max_simultaneous_downloads_per_domain: 1,
            download_delay: 0.0,
            ..RateLimitingOptions::default()
        };
        let fabric = RateLimitFabric::new(&options);

        let permit = fabric.download_limiter("example").await.unwrap();
        assert_eq!(fabric.available_download_slots(), 1);
        assert_eq!(fabric.download_semaphore("example").available_permits(), 0);
        drop(permit);
        assert_eq!(fabric.available_download_slots(), 2);
        assert_eq!(fabric.download_semaphore("example").available_permits(), 1);
    }

    #[tokio::test]
    async fn test_download_limiter_applies_spacer_sleep() {
        tokio::time::pause();
        let options = RateLimitingOptions {
            download_delay: 0.2,
            ..RateLimitingOptions::default()
        };
        let fabric = RateLimitFabric::new(&options);
        let start = Instant::now();
        // bunkr spacer is 0.5 -> total pre-sleep 0.7s
        let _permit = fabric.download_limiter("bunkr").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(700));
    }
}
