//! HLS segment expansion and ffmpeg concat.
//!
//! An m3u8 index is reduced to its segment name lines, each segment becomes
//! a download task with a zero-padded `.cdl_hsl` filename inside a sibling
//! `<name>.temp` folder, and ffmpeg concatenates the sorted segment files
//! into the final output.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;
use url::Url;

use crate::errors::CdlError;

/// Extension given to downloaded segment files.
pub const SEGMENT_EXTENSION: &str = "cdl_hsl";

/// One expanded HLS segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsSegment {
    /// Segment name as it appears in the index.
    pub name: String,
    /// Zero-padded on-disk filename (`00001.cdl_hsl`).
    pub custom_name: String,
    /// Absolute segment URL.
    pub url: Url,
}

/// Returns the segment name lines of an m3u8 index: non-empty lines that do
/// not start with `#`.
#[must_use]
pub fn valid_segment_lines(m3u8_content: &str) -> Vec<String> {
    m3u8_content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect()
}

/// Zero-padding width for segment indices: at least five digits, more when
/// the segment count needs them.
#[must_use]
pub fn segment_padding(segment_count: usize) -> usize {
    segment_count.to_string().len().max(5)
}

/// Expands an m3u8 index into segments resolved against the playlist base
/// URL.
///
/// # Errors
///
/// Returns a download error when a segment URL cannot be formed.
pub fn create_segments(base: &Url, m3u8_content: &str) -> Result<Vec<HlsSegment>, CdlError> {
    let names = valid_segment_lines(m3u8_content);
    let padding = segment_padding(names.len());

    let mut segments = Vec::with_capacity(names.len());
    for (index, name) in names.iter().enumerate() {
        let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), name);
        let url = Url::parse(&joined)
            .map_err(|_| CdlError::download("HLS Error", format!("invalid segment URL {joined}")))?;
        let custom_name = format!("{:0padding$}.{SEGMENT_EXTENSION}", index + 1);
        segments.push(HlsSegment {
            name: name.clone(),
            custom_name,
            url,
        });
    }
    Ok(segments)
}

/// Whether an ffmpeg binary is reachable on this system.
pub async fn ffmpeg_available() -> bool {
    Command::new("ffmpeg")
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Concatenates sorted segment files into `output` with ffmpeg's concat
/// demuxer.
///
/// # Errors
///
/// Returns `DownloadError("FFmpeg Concat Error")` carrying ffmpeg's stderr
/// when the process fails, and IO errors when the list file cannot be
/// written.
pub async fn concat_segments(segments: &[PathBuf], output: &Path) -> Result<(), CdlError> {
    let mut sorted: Vec<&PathBuf> = segments.iter().collect();
    sorted.sort();

    let mut list = String::new();
    for path in &sorted {
        let escaped = path.to_string_lossy().replace('\'', "'\\''");
        list.push_str(&format!("file '{escaped}'\n"));
    }
    let list_path = output.with_extension("concat.txt");
    tokio::fs::write(&list_path, list)
        .await
        .map_err(|e| CdlError::io(list_path.clone(), e))?;

    debug!(segments = sorted.len(), output = %output.display(), "running ffmpeg concat");
    let result = Command::new("ffmpeg")
        .arg("-y")
        .args(["-f", "concat", "-safe", "0", "-i"])
        .arg(&list_path)
        .args(["-c", "copy"])
        .arg(output)
        .output()
        .await;
    let _ = tokio::fs::remove_file(&list_path).await;

    let output_result = result.map_err(|e| CdlError::io(output.to_path_buf(), e))?;
    if !output_result.status.success() {
        let stderr = String::from_utf8_lossy(&output_result.stderr);
        let tail: String = stderr.chars().rev().take(400).collect::<String>()
            .chars().rev().collect();
        return Err(CdlError::download("FFmpeg Concat Error", tail));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SAMPLE_M3U8: &str = "#EXTM3U\n\
        #EXT-X-VERSION:3\n\
        #EXTINF:4.0,\n\
        seg-0001.ts\n\
        #EXTINF:4.0,\n\
        seg-0002.ts\n\
        \n\
        #EXTINF:2.5,\n\
        seg-0003.ts\n\
        #EXT-X-ENDLIST\n";

    #[test]
    fn test_valid_segment_lines_skips_comments_and_blanks() {
        let lines = valid_segment_lines(SAMPLE_M3U8);
        assert_eq!(lines, vec!["seg-0001.ts", "seg-0002.ts", "seg-0003.ts"]);
    }

    #[test]
    fn test_valid_segment_lines_trims_whitespace() {
        let lines = valid_segment_lines("  seg.ts  \n\t#comment\n");
        assert_eq!(lines, vec!["seg.ts"]);
    }

    #[test]
    fn test_segment_padding_minimum_five() {
        assert_eq!(segment_padding(7), 5);
        assert_eq!(segment_padding(99_999), 5);
        assert_eq!(segment_padding(100_000), 6);
        assert_eq!(segment_padding(1_234_567), 7);
    }

    #[test]
    fn test_create_segments_names_and_urls() {
        let base: Url = "https://cdn.example.host/hls/v1".parse().unwrap();
        let segments = create_segments(&base, SAMPLE_M3U8).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].custom_name, "00001.cdl_hsl");
        assert_eq!(segments[2].custom_name, "00003.cdl_hsl");
        assert_eq!(
            segments[0].url.as_str(),
            "https://cdn.example.host/hls/v1/seg-0001.ts"
        );
    }

    #[test]
    fn test_create_segments_with_trailing_slash_base() {
        let base: Url = "https://cdn.example.host/hls/".parse().unwrap();
        let segments = create_segments(&base, "seg.ts\n").unwrap();
        assert_eq!(segments[0].url.as_str(), "https://cdn.example.host/hls/seg.ts");
    }

    #[test]
    fn test_create_segments_empty_index() {
        let base: Url = "https://cdn.example.host/hls".parse().unwrap();
        let segments = create_segments(&base, "#EXTM3U\n#EXT-X-ENDLIST\n").unwrap();
        assert!(segments.is_empty());
    }

    #[test]
    fn test_custom_names_sort_in_segment_order() {
        let base: Url = "https://cdn.example.host/hls".parse().unwrap();
        let m3u8: String = (0..12).map(|i| format!("seg-{i}.ts\n")).collect();
        let mut names: Vec<String> = create_segments(&base, &m3u8)
            .unwrap()
            .iter()
            .map(|s| s.custom_name.clone())
            .collect();
        let ordered = names.clone();
        names.sort();
        assert_eq!(names, ordered, "zero padding must keep lexicographic order");
    }
}
