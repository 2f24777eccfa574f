//! Error taxonomy shared by the scraper, downloader, and hashing engines.
//!
//! Every failure the engine can surface is a [`CdlError`] variant. The
//! downloader's exception boundary normalizes transport errors into
//! `Download` variants carrying a status and a retry flag; the outer task
//! wrapper logs terminal failures and never propagates them out of a task.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Status code for progress-based retries that do not count against the
/// attempt ceiling (the partial file grew since the last attempt).
pub const PROGRESS_RETRY_STATUS: u16 = 999;

/// Status attached to a scrape/download failure: an HTTP code or a named
/// condition such as "Bunkr Maintenance" or "HLS Seg Error".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureStatus {
    /// Plain HTTP status code (including the synthetic 418 and 999 codes).
    Http(u16),
    /// Named non-HTTP failure condition.
    Named(Cow<'static, str>),
}

impl fmt::Display for FailureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(code) => write!(f, "{code}"),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

impl From<u16> for FailureStatus {
    fn from(code: u16) -> Self {
        Self::Http(code)
    }
}

impl From<&'static str> for FailureStatus {
    fn from(name: &'static str) -> Self {
        Self::Named(Cow::Borrowed(name))
    }
}

impl From<String> for FailureStatus {
    fn from(name: String) -> Self {
        Self::Named(Cow::Owned(name))
    }
}

/// Errors raised by the scrape/download pipeline.
#[derive(Debug, Error)]
pub enum CdlError {
    /// An extractor could not parse a page or the site returned an
    /// unexpected shape.
    #[error("scrape failed ({status}): {message}")]
    Scrape {
        /// HTTP status or named condition.
        status: FailureStatus,
        /// Human-readable detail.
        message: String,
    },

    /// Transport/HTTP failure below the scraper.
    #[error("download failed ({status}): {message}")]
    Download {
        /// HTTP status or named condition.
        status: FailureStatus,
        /// Human-readable detail.
        message: String,
        /// Whether the retry wrapper may consume this failure.
        retry: bool,
    },

    /// An anti-bot challenge page was encountered.
    #[error("DDoS guard challenge encountered: {message}")]
    DdosGuard {
        /// Detail about the challenge or the solver outcome.
        message: String,
    },

    /// The response body kind did not match what the caller expected.
    #[error("invalid content type: {message}")]
    InvalidContentType {
        /// What was received vs expected.
        message: String,
    },

    /// The file extension class is excluded by configuration.
    #[error("file type '{ext}' is excluded by configuration")]
    RestrictedFiletype {
        /// The offending extension (with leading dot).
        ext: String,
    },

    /// The media duration falls outside the configured range.
    #[error("duration {seconds}s is outside the allowed range")]
    Duration {
        /// Duration of the media item in seconds.
        seconds: f64,
    },

    /// The target mount has less free space than `required_free_space`.
    #[error("insufficient free space for downloads to {}", folder.display())]
    InsufficientFreeSpace {
        /// Download folder that could not be written.
        folder: PathBuf,
    },

    /// The site requires a logged-in session.
    #[error("login required: {message}")]
    Login {
        /// Detail about the login requirement.
        message: String,
    },

    /// An extractor emitted more children than its configured limit.
    #[error("maximum child item count ({limit}) exceeded")]
    MaxChildren {
        /// The configured child limit.
        limit: u32,
    },

    /// Raw transport error (DNS, TLS, connect, body read).
    #[error("request to {url} failed: {source}")]
    Http {
        /// The URL that failed.
        url: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// Filesystem error while writing or finalizing a download.
    #[error("IO error at {}: {source}", path.display())]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Database error from the history or hash store.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The engine is shutting down and a gate was closed under a waiter.
    #[error("shutdown in progress")]
    Shutdown,
}

impl CdlError {
    /// Creates a non-retryable download error.
    pub fn download(status: impl Into<FailureStatus>, message: impl Into<String>) -> Self {
        Self::Download {
            status: status.into(),
            message: message.into(),
            retry: false,
        }
    }

    /// Creates a retryable download error.
    pub fn download_retry(status: impl Into<FailureStatus>, message: impl Into<String>) -> Self {
        Self::Download {
            status: status.into(),
            message: message.into(),
            retry: true,
        }
    }

    /// Creates a progress-based retry (status 999). Does not count against
    /// the attempt ceiling.
    pub fn progress_retry() -> Self {
        Self::download_retry(PROGRESS_RETRY_STATUS, "Download timeout reached, retrying")
    }

    /// Creates a scrape error.
    pub fn scrape(status: impl Into<FailureStatus>, message: impl Into<String>) -> Self {
        Self::Scrape {
            status: status.into(),
            message: message.into(),
        }
    }

    /// Creates a DDoS-guard challenge error.
    pub fn ddos_guard(message: impl Into<String>) -> Self {
        Self::DdosGuard {
            message: message.into(),
        }
    }

    /// Creates an invalid-content-type error.
    pub fn invalid_content_type(message: impl Into<String>) -> Self {
        Self::InvalidContentType {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    pub fn http(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Http {
            url: url.into(),
            source,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the progress counter should be reset instead of incremented
    /// for this failure.
    #[must_use]
    pub fn is_progress_retry(&self) -> bool {
        matches!(
            self,
            Self::Download {
                status: FailureStatus::Http(PROGRESS_RETRY_STATUS),
                ..
            }
        )
    }

    /// Short status label for the failure log and run stats.
    #[must_use]
    pub fn ui_failure(&self) -> String {
        match self {
            Self::Scrape { status, .. } | Self::Download { status, .. } => status.to_string(),
            Self::DdosGuard { .. } => "DDoS-Guard".to_string(),
            Self::InvalidContentType { .. } => "Invalid Content Type".to_string(),
            Self::RestrictedFiletype { .. } => "Restricted Filetype".to_string(),
            Self::Duration { .. } => "Duration Filter".to_string(),
            Self::InsufficientFreeSpace { .. } => "Insufficient Free Space".to_string(),
            Self::Login { .. } => "Login Required".to_string(),
            Self::MaxChildren { .. } => "Max Children Reached".to_string(),
            Self::Http { .. } => "Request Error".to_string(),
            Self::Io { .. } => "IO Error".to_string(),
            Self::Database(_) => "Database Error".to_string(),
            Self::Shutdown => "Shutdown".to_string(),
        }
    }
}
