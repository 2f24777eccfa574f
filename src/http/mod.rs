//! HTTP client layer: cookie-jar-backed sessions, response caching, status
//! classification, and the anti-bot escalation path.

pub mod cache;
pub mod challenge;
pub mod cookies;
pub mod download_client;
pub mod flaresolverr;
pub mod scraper_client;

pub use cache::{CachedResponse, ResponseCache};
pub use challenge::{check_cloudflare, check_ddos_guard, is_challenge_page};
pub use cookies::{install_cookie, load_cookie_files, CookieLine};
pub use download_client::{DownloadClient, StreamedBody};
pub use flaresolverr::{Flaresolverr, SolvedResponse};
pub use scraper_client::{classify_response, RequestOptions, ScraperClient, DOWNLOAD_ERROR_ETAGS};
