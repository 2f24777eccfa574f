//! Work-unit types: [`ScrapeItem`] for the scraper engine and [`MediaItem`]
//! for the downloader, plus extension classification and filename hygiene.

use std::path::{Path, PathBuf};

use url::Url;

use crate::errors::CdlError;

/// Maximum sanitized filename length (stem truncated, extension kept).
const MAX_FILENAME_LENGTH: usize = 100;

/// Extensions classified as images.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".jpe", ".svg", ".tif", ".tiff", ".jif",
];

/// Extensions classified as videos.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    ".mpeg", ".avchd", ".webm", ".mpv", ".swf", ".avi", ".m4p", ".wmv", ".mp2", ".m4v", ".qt",
    ".mpe", ".mp4", ".flv", ".mov", ".mpg", ".ogg", ".ts", ".mkv",
];

/// Extensions classified as audio.
pub const AUDIO_EXTENSIONS: &[&str] = &[".mp3", ".flac", ".wav", ".m4a"];

/// Broad media class used by the extension allow/deny filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Video,
    Audio,
    Other,
}

impl FileKind {
    /// Classifies a lowercase extension (with leading dot).
    #[must_use]
    pub fn from_ext(ext: &str) -> Self {
        let ext = ext.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Self::Image
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Self::Video
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            Self::Audio
        } else {
            Self::Other
        }
    }
}

/// Classification of a scrape work unit by URL shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeItemKind {
    /// A page describing a single file.
    File,
    /// An album/gallery page expanding into many files.
    Album,
    /// A user/creator profile expanding into albums.
    Profile,
    /// A search-results page.
    Search,
    /// A direct link to a downloadable file.
    Direct,
}

/// One URL to scrape. Created by CLI ingest or a parent extractor, mutated
/// only by the owning extractor, and dropped when its extractor returns.
#[derive(Debug, Clone)]
pub struct ScrapeItem {
    /// Source URL.
    pub url: Url,
    /// Parent URL chain, oldest first (used for breadcrumb/album titling).
    pub parents: Vec<Url>,
    /// Shape classification.
    pub kind: ScrapeItemKind,
    /// Album title inherited from the parent, when inside an album.
    pub album_title: Option<String>,
    /// Album id inherited from the parent.
    pub album_id: Option<String>,
    /// Publication timestamp (unix seconds) when the site provides one.
    pub published: Option<i64>,
    /// Number of children emitted so far.
    pub children: u32,
    /// Ceiling on emitted children; `None` means unbounded.
    pub children_limit: Option<u32>,
    /// Task id assigned by the engine.
    pub task_id: u64,
}

impl ScrapeItem {
    /// Creates a root scrape item with no parent chain.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            parents: Vec::new(),
            kind: ScrapeItemKind::Direct,
            album_title: None,
            album_id: None,
            published: None,
            children: 0,
            children_limit: None,
            task_id: 0,
        }
    }

    /// Creates a child item inheriting this item's chain and album context.
    #[must_use]
    pub fn child(&self, url: Url, kind: ScrapeItemKind) -> Self {
        let mut parents = self.parents.clone();
        parents.push(self.url.clone());
        Self {
            url,
            parents,
            kind,
            album_title: self.album_title.clone(),
            album_id: self.album_id.clone(),
            published: self.published,
            children: 0,
            children_limit: self.children_limit,
            task_id: 0,
        }
    }

    /// Counts an emitted child against the limit.
    ///
    /// # Errors
    ///
    /// Returns [`CdlError::MaxChildren`] once the limit is surpassed.
    pub fn add_child(&mut self) -> Result<(), CdlError> {
        self.children += 1;
        if let Some(limit) = self.children_limit {
            if self.children > limit {
                return Err(CdlError::MaxChildren { limit });
            }
        }
        Ok(())
    }
}

/// One file to download.
#[derive(Debug, Clone)]
pub struct MediaItem {
    /// Source URL of the file body.
    pub url: Url,
    /// Referer sent with the request.
    pub referer: Url,
    /// Filename as the site reported it, before sanitization.
    pub original_filename: String,
    /// Sanitized on-disk filename (including extension).
    pub filename: String,
    /// Lowercase extension with leading dot ("" when none).
    pub ext: String,
    /// Target folder for the completed file.
    pub download_folder: PathBuf,
    /// Media duration in seconds when known (drives the duration filter).
    pub duration: Option<f64>,
    /// Content hash filled in by the hash engine.
    pub hash: Option<String>,
    /// Base URL for HLS segment expansion or debrid redirects.
    pub debrid_link: Option<Url>,
    /// Publication timestamp (unix seconds) used for file times.
    pub published: Option<i64>,
    /// Current retry attempt (0 until the first attempt starts).
    pub current_attempt: u32,
    /// Task id assigned by the engine.
    pub task_id: u64,
    /// Whether this item is an HLS segment rather than a user-visible file.
    pub is_segment: bool,
}

impl MediaItem {
    /// Creates a media item for `url`, deriving the filename from the URL's
    /// last path segment.
    #[must_use]
    pub fn new(url: Url, referer: Url, download_folder: PathBuf) -> Self {
        let original = filename_from_url(&url);
        Self::with_filename(url, referer, download_folder, &original)
    }

    /// Creates a media item with an explicit filename (HLS segments and
    /// extractors that name files from page metadata).
    #[must_use]
    pub fn with_filename(
        url: Url,
        referer: Url,
        download_folder: PathBuf,
        original_filename: &str,
    ) -> Self {
        let filename = sanitize_filename(original_filename);
        let ext = extension_of(&filename);
        Self {
            url,
            referer,
            original_filename: original_filename.to_string(),
            filename,
            ext,
            download_folder,
            duration: None,
            hash: None,
            debrid_link: None,
            published: None,
            current_attempt: 0,
            task_id: 0,
            is_segment: false,
        }
    }

    /// Path of the completed file.
    #[must_use]
    pub fn complete_file(&self) -> PathBuf {
        self.download_folder.join(&self.filename)
    }

    /// Path of the in-progress partial file (`<name>.part`).
    #[must_use]
    pub fn partial_file(&self) -> PathBuf {
        self.download_folder.join(format!("{}.part", self.filename))
    }

    /// Media class of this item's extension.
    #[must_use]
    pub fn file_kind(&self) -> FileKind {
        FileKind::from_ext(&self.ext)
    }
}

/// Derives a filename from a URL's last path segment, percent-decoded.
/// Falls back to the host when the path has no usable segment.
#[must_use]
pub fn filename_from_url(url: &Url) -> String {
    let last = url
        .path_segments()
        .and_then(|mut segments| segments.next_back().map(ToString::to_string))
        .filter(|segment| !segment.is_empty());
    match last {
        Some(segment) => urlencoding::decode(&segment)
            .map(|decoded| decoded.into_owned())
            .unwrap_or(segment),
        None => url.host_str().unwrap_or("download").to_string(),
    }
}

/// Lowercase extension (with leading dot) of a filename, or "".
#[must_use]
pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// Sanitizes a filename for on-disk use: path separators and control
/// characters become underscores, and overlong stems are truncated while the
/// extension is preserved.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        };
        out.push(mapped);
    }
    let out = out.trim().trim_matches('.').to_string();
    if out.is_empty() {
        return "unnamed".to_string();
    }
    if out.chars().count() <= MAX_FILENAME_LENGTH {
        return out;
    }
    let ext = extension_of(&out);
    let keep = MAX_FILENAME_LENGTH.saturating_sub(ext.chars().count());
    let stem: String = out.chars().take(keep).collect();
    format!("{stem}{ext}")
}
