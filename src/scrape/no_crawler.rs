//! Generic extractor for hosts without a dedicated module.
//!
//! Only direct file URLs are handled: when the URL's last path segment looks
//! like a file it is queued for download into a per-host folder, otherwise
//! the item fails with an unsupported-URL scrape error.

use async_trait::async_trait;

use crate::errors::CdlError;
use crate::items::{extension_of, filename_from_url, MediaItem, ScrapeItem};
use crate::scrape::extractor::{Extractor, ScrapeContext};

/// Domain tag for the generic extractor.
pub const NO_CRAWLER_DOMAIN: &str = "no_crawler";

/// Fallback extractor for unknown hosts.
#[derive(Debug, Default)]
pub struct NoCrawler;

#[async_trait]
impl Extractor for NoCrawler {
    fn primary_domain(&self) -> &'static str {
        NO_CRAWLER_DOMAIN
    }

    async fn fetch(&self, ctx: &ScrapeContext, item: &mut ScrapeItem) -> Result<(), CdlError> {
        let filename = filename_from_url(&item.url);
        if extension_of(&filename).is_empty() {
            return Err(CdlError::scrape(
                "Unsupported",
                format!("no extractor for {} and the URL is not a direct file", item.url),
            ));
        }

        let host = item.url.host_str().unwrap_or("unknown");
        let folder = ctx.download_folder.join(host);
        let referer = item.parents.last().cloned().unwrap_or_else(|| item.url.clone());
        let mut media_item =
            MediaItem::with_filename(item.url.clone(), referer, folder, &filename);
        media_item.published = item.published;
        ctx.queue_media(item, NO_CRAWLER_DOMAIN, media_item)
    }
}
