//! Per-run CSV failure log.
//!
//! One row per terminal failure: the URL, its referer, the short status
//! label, and the error message. The file is created lazily on the first
//! failure so successful runs leave no log behind.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// CSV header row.
const HEADER: &str = "url,referer,status,message";

/// Append-only failure log.
#[derive(Debug)]
pub struct FailureLog {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl FailureLog {
    /// Creates a log that will write to `path` on the first failure.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one failure row. Logging failures are reported but never
    /// propagate into the download pipeline.
    pub async fn write_row(&self, url: &str, referer: &str, status: &str, message: &str) {
        let row = format!(
            "{},{},{},{}\n",
            escape_field(url),
            escape_field(referer),
            escape_field(status),
            escape_field(message),
        );

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
            {
                Ok(mut file) => {
                    let fresh = file
                        .metadata()
                        .await
                        .map(|meta| meta.len() == 0)
                        .unwrap_or(true);
                    if fresh {
                        let _ = file.write_all(HEADER.as_bytes()).await;
                        let _ = file.write_all(b"\n").await;
                    }
                    *guard = Some(file);
                }
                Err(error) => {
                    warn!(path = %self.path.display(), %error, "unable to open failure log");
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            if let Err(error) = file.write_all(row.as_bytes()).await {
                warn!(path = %self.path.display(), %error, "unable to append failure log row");
            }
            let _ = file.flush().await;
        }
    }
}

/// Minimal CSV quoting: fields containing a comma, quote, or newline are
/// wrapped in quotes with inner quotes doubled.
fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_file_until_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.csv");
        let log = FailureLog::new(&path);
        assert!(!path.exists());

        log.write_row("https://example.host/a.jpg", "https://example.host", "404", "gone")
            .await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.csv");
        let log = FailureLog::new(&path);

        log.write_row("https://a", "https://r", "404", "gone").await;
        log.write_row("https://b", "https://r", "500", "boom").await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].starts_with("https://a,"));
        assert!(lines[2].starts_with("https://b,"));
    }

    #[tokio::test]
    async fn test_fields_with_commas_are_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.csv");
        let log = FailureLog::new(&path);

        log.write_row("https://a", "https://r", "HLS Seg Error", "failed: 3/7, retained")
            .await;
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"failed: 3/7, retained\""));
    }

    #[test]
    fn test_escape_field_quotes() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
