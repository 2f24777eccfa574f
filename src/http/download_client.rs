//! Streaming download session with HTTP range resume.
//!
//! Bodies stream straight to the item's `.part` file. When a partial exists
//! and the server advertises byte ranges, the request carries
//! `Range: bytes=<existing>-` and the body is appended; otherwise the
//! partial is truncated and written from scratch. The partial is never
//! renamed here: the downloader does that only after the announced
//! Content-Length (when provided) matches what landed on disk.

use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_TYPE, RANGE, REFERER};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};

use crate::config::Settings;
use crate::errors::CdlError;
use crate::http::scraper_client::classify_response;
use crate::items::MediaItem;

/// Content-Length of the Bunkr maintenance placeholder video.
const BUNKR_MAINTENANCE_LENGTH: &str = "322509";

/// Outcome of one streamed download attempt.
#[derive(Debug, Clone, Copy)]
pub struct StreamedBody {
    /// Bytes written by this attempt.
    pub bytes_written: u64,
    /// Total size of the partial file after this attempt.
    pub total_size: u64,
    /// Announced total size (existing bytes + Content-Length on 206).
    pub expected: Option<u64>,
    /// Whether the server honored a range resume.
    pub resumed: bool,
}

/// Streaming HTTP client for file bodies.
#[derive(Debug)]
pub struct DownloadClient {
    client: reqwest::Client,
}

impl DownloadClient {
    /// Builds the download session over the shared cookie jar.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the HTTP client cannot be built.
    pub fn new(jar: Arc<Jar>, settings: &Settings) -> Result<Self, CdlError> {
        let client = reqwest::Client::builder()
            .cookie_provider(jar)
            .user_agent(settings.general.user_agent.clone())
            .connect_timeout(settings.rate_limiting.connect_timeout())
            .timeout(settings.rate_limiting.total_timeout())
            .build()
            .map_err(|e| CdlError::http("download client", e))?;
        Ok(Self { client })
    }

    /// Streams `item.url` into `item.partial_file()`.
    ///
    /// # Errors
    ///
    /// Classification errors (dead ETags, maintenance placeholders,
    /// challenge pages, plain HTTP errors) and transport/IO failures. A
    /// body shorter than the announced Content-Length is a retryable
    /// download error.
    #[instrument(level = "debug", skip(self, item), fields(url = %item.url))]
    pub async fn download_file(&self, item: &MediaItem) -> Result<StreamedBody, CdlError> {
        let partial = item.partial_file();
        if let Some(parent) = partial.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CdlError::io(parent.to_path_buf(), e))?;
        }

        let existing = tokio::fs::metadata(&partial)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        let resume = existing > 0 && self.supports_ranges(item).await;
        let mut request = self
            .client
            .get(item.url.clone())
            .header(REFERER, item.referer.as_str());
        if resume {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| CdlError::http(item.url.as_str(), e))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let host = response.url().host_str().unwrap_or_default().to_string();

        check_bunkr_maintenance(&headers)?;
        if !(200..400).contains(&status) {
            let body = response
                .bytes()
                .await
                .map_err(|e| CdlError::http(item.url.as_str(), e))?;
            classify_response(status, &headers, &body, &host, true)?;
            // Non-2xx always classifies as an error above.
            return Err(CdlError::download(status, format!("HTTP {status}")));
        }
        classify_response(status, &headers, &[], &host, true)?;

        let appending = resume && status == 206;
        let file = if appending {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&partial)
                .await
                .map_err(|e| CdlError::io(partial.clone(), e))?
        } else {
            tokio::fs::File::create(&partial)
                .await
                .map_err(|e| CdlError::io(partial.clone(), e))?
        };

        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let expected = match (appending, content_length) {
            (true, Some(remaining)) => Some(existing.saturating_add(remaining)),
            (false, Some(total)) => Some(total),
            (_, None) => None,
        };

        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut bytes_written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CdlError::http(item.url.as_str(), e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| CdlError::io(partial.clone(), e))?;
            bytes_written += chunk.len() as u64;
        }
        writer
            .flush()
            .await
            .map_err(|e| CdlError::io(partial.clone(), e))?;

        let total_size = if appending {
            existing.saturating_add(bytes_written)
        } else {
            bytes_written
        };

        if let Some(expected) = expected {
            if total_size != expected {
                return Err(CdlError::download_retry(
                    "Incomplete Body",
                    format!("received {total_size} of {expected} announced bytes"),
                ));
            }
        }

        debug!(
            bytes = bytes_written,
            total = total_size,
            resumed = appending,
            "body streamed to partial file"
        );
        Ok(StreamedBody {
            bytes_written,
            total_size,
            expected,
            resumed: appending,
        })
    }

    /// Whether the server advertises byte-range support for this URL.
    async fn supports_ranges(&self, item: &MediaItem) -> bool {
        let response = self
            .client
            .head(item.url.clone())
            .header(REFERER, item.referer.as_str())
            .send()
            .await;
        response
            .ok()
            .and_then(|r| {
                r.headers()
                    .get(ACCEPT_RANGES)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.eq_ignore_ascii_case("bytes"))
            })
            .unwrap_or(false)
    }
}

/// Rejects the Bunkr maintenance placeholder before any bytes stream.
fn check_bunkr_maintenance(headers: &HeaderMap) -> Result<(), CdlError> {
    let length = headers.get(CONTENT_LENGTH).and_then(|v| v.to_str().ok());
    let kind = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    if length == Some(BUNKR_MAINTENANCE_LENGTH) && kind == Some("video/mp4") {
        return Err(CdlError::download(
            "Bunkr Maintenance",
            "Bunkr under maintenance",
        ));
    }
    Ok(())
}
