//! Settings model and config-directory resolution.
//!
//! Settings are deserialized from an optional JSON config file; every field
//! has a default so a bare run works without one. CLI flags override the
//! loaded values in `main`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable that overrides the config/app-data directory.
pub const CONFIG_DIR_ENV: &str = "CDL_CONFIG_DIR";

/// Environment variable that forces verbose tracing.
pub const DEBUG_ENV: &str = "CDL_DEBUG";

/// Default required free space on a mount before downloads pause (512 MiB).
const DEFAULT_REQUIRED_FREE_SPACE: u64 = 512 * 1024 * 1024;

/// How the hash engine runs relative to downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashingMode {
    /// Hashing disabled entirely.
    Off,
    /// Hash each file immediately after its download completes.
    InPlace,
    /// Hash all completed files after the run finishes.
    #[default]
    PostRun,
}

impl FromStr for HashingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "in_place" | "in-place" => Ok(Self::InPlace),
            "post_run" | "post-run" => Ok(Self::PostRun),
            _ => Err(format!("invalid hashing mode: {s}")),
        }
    }
}

/// General settings shared across clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// User-Agent sent on every request.
    pub user_agent: String,
    /// Flaresolverr endpoint base URL, e.g. `http://localhost:8191`.
    /// `None` disables the anti-bot bypass path.
    pub flaresolverr: Option<String>,
    /// Minimum free bytes on a mount before downloads pause.
    pub required_free_space: u64,
    /// Pause the run instead of failing when free space is exhausted.
    pub pause_on_insufficient_space: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            flaresolverr: None,
            required_free_space: DEFAULT_REQUIRED_FREE_SPACE,
            pause_on_insufficient_space: true,
        }
    }
}

/// Rate limiting and timeout knobs for the request/download fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitingOptions {
    /// HTTP connect timeout in seconds.
    pub connection_timeout: u64,
    /// HTTP read timeout in seconds (total timeout = connect + read).
    pub read_timeout: u64,
    /// Global request rate (requests per second).
    pub rate_limit: u32,
    /// Seconds added before every download on top of the domain spacer.
    pub download_delay: f64,
    /// Global ceiling on simultaneous downloads.
    pub max_simultaneous_downloads: usize,
    /// Default per-domain ceiling on simultaneous downloads.
    pub max_simultaneous_downloads_per_domain: usize,
    /// Retry ceiling for a single media item.
    pub download_attempts: u32,
}

impl Default for RateLimitingOptions {
    fn default() -> Self {
        Self {
            connection_timeout: 15,
            read_timeout: 300,
            rate_limit: 25,
            download_delay: 0.0,
            max_simultaneous_downloads: 15,
            max_simultaneous_downloads_per_domain: 3,
            download_attempts: 5,
        }
    }
}

impl RateLimitingOptions {
    /// Connect timeout as a `Duration`.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    /// Total timeout (connect + read) as a `Duration`.
    #[must_use]
    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout + self.read_timeout)
    }
}

/// Download behavior toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// Cap every item at a single attempt regardless of `download_attempts`.
    pub disable_download_attempt_limit: bool,
    /// Skip setting file times from the item's published timestamp.
    pub disable_file_timestamps: bool,
}

/// File-class and duration exclusion filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreOptions {
    /// Skip files classified as images.
    pub exclude_images: bool,
    /// Skip files classified as videos.
    pub exclude_videos: bool,
    /// Skip files classified as audio.
    pub exclude_audio: bool,
    /// Skip files that match none of the media classes.
    pub exclude_other: bool,
    /// Minimum media duration in seconds, when known.
    pub minimum_duration: Option<f64>,
    /// Maximum media duration in seconds, when known.
    pub maximum_duration: Option<f64>,
}

impl IgnoreOptions {
    /// Whether a known duration passes the configured range.
    #[must_use]
    pub fn duration_allowed(&self, seconds: f64) -> bool {
        if let Some(min) = self.minimum_duration {
            if seconds < min {
                return false;
            }
        }
        if let Some(max) = self.maximum_duration {
            if seconds > max {
                return false;
            }
        }
        true
    }
}

/// Dedup/hash policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DupeCleanupOptions {
    /// When hashing runs (off / in place / post run).
    pub hashing: HashingMode,
    /// Delete later duplicates after hashing completes.
    pub auto_dedupe: bool,
    /// Record md5 hashes in addition to xxh128.
    pub add_md5_hash: bool,
    /// Record sha256 hashes in addition to xxh128.
    pub add_sha256_hash: bool,
    /// Send removed duplicates to the OS trash instead of unlinking.
    pub send_deleted_to_trash: bool,
}

impl Default for DupeCleanupOptions {
    fn default() -> Self {
        Self {
            hashing: HashingMode::PostRun,
            auto_dedupe: true,
            add_md5_hash: false,
            add_sha256_hash: false,
            send_deleted_to_trash: true,
        }
    }
}

/// Runtime toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Re-download URLs even when the history ledger marks them complete.
    pub ignore_history: bool,
}

/// Top-level settings container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub rate_limiting: RateLimitingOptions,
    pub download_options: DownloadOptions,
    pub ignore_options: IgnoreOptions,
    pub dupe_cleanup: DupeCleanupOptions,
    pub runtime: RuntimeOptions,
}

impl Settings {
    /// Loads settings from a JSON file, or defaults when `path` is `None`.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the file cannot be read and a serde error
    /// when it cannot be parsed.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&raw)?)
            }
            None => Ok(Self::default()),
        }
    }

    /// Effective retry ceiling for a single media item.
    #[must_use]
    pub fn max_download_attempts(&self) -> u32 {
        if self.download_options.disable_download_attempt_limit {
            1
        } else {
            self.rate_limiting.download_attempts.max(1)
        }
    }
}

/// Default User-Agent identifying the tool.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("cyberdrop-dl/{version}")
}

/// Resolves the config/app-data directory.
///
/// `CDL_CONFIG_DIR` wins; otherwise `$HOME/.config/cyberdrop-dl`, falling
/// back to `./.cyberdrop-dl` when no home directory is available.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    match std::env::var("HOME") {
        Ok(home) if !home.trim().is_empty() => {
            PathBuf::from(home).join(".config").join("cyberdrop-dl")
        }
        _ => PathBuf::from(".cyberdrop-dl"),
    }
}

/// Directory holding per-domain Netscape cookie files.
#[must_use]
pub fn cookies_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("Cookies")
}
