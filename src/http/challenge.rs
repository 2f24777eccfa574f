//! Anti-bot challenge-page detection.
//!
//! A page counts as a challenge when its `<title>` equals one of a fixed set
//! of titles (case-insensitive) or when any of a fixed set of CSS selectors
//! matches.

use scraper::{Html, Selector};

/// Titles served by DDoS-Guard interstitials.
pub const DDOS_GUARD_CHALLENGE_TITLES: &[&str] = &["Just a moment...", "DDoS-Guard"];

/// Selectors present on DDoS-Guard interstitials.
pub const DDOS_GUARD_CHALLENGE_SELECTORS: &[&str] = &[
    "#cf-challenge-running",
    ".ray_id",
    ".attack-box",
    "#cf-please-wait",
    "#challenge-spinner",
    "#trk_jschal_js",
    "#turnstile-wrapper",
    ".lds-ring",
];

/// Titles served by Cloudflare interstitials.
pub const CLOUDFLARE_CHALLENGE_TITLES: &[&str] =
    &["Simpcity Cuck Detection", "Attention Required! | Cloudflare"];

/// Selectors present on Cloudflare interstitials.
pub const CLOUDFLARE_CHALLENGE_SELECTORS: &[&str] = &["captchawrapper", "cf-turnstile"];

/// Whether a parsed document matches DDoS-Guard challenge markers.
#[must_use]
pub fn check_ddos_guard(document: &Html) -> bool {
    check_markers(
        document,
        DDOS_GUARD_CHALLENGE_TITLES,
        DDOS_GUARD_CHALLENGE_SELECTORS,
    )
}

/// Whether a parsed document matches Cloudflare challenge markers.
#[must_use]
pub fn check_cloudflare(document: &Html) -> bool {
    check_markers(
        document,
        CLOUDFLARE_CHALLENGE_TITLES,
        CLOUDFLARE_CHALLENGE_SELECTORS,
    )
}

/// Whether a raw HTML body is an anti-bot challenge page.
///
/// Parsing happens here, in a synchronous scope, because `scraper::Html` is
/// not `Send` and must never be held across an await point.
#[must_use]
pub fn is_challenge_page(body: &str) -> bool {
    let document = Html::parse_document(body);
    check_ddos_guard(&document) || check_cloudflare(&document)
}

fn check_markers(document: &Html, titles: &[&str], selectors: &[&str]) -> bool {
    if let Some(title) = page_title(document) {
        let title = title.trim();
        if titles.iter().any(|t| t.eq_ignore_ascii_case(title)) {
            return true;
        }
    }

    selectors.iter().any(|selector| {
        Selector::parse(selector)
            .map(|selector| document.select(&selector).next().is_some())
            .unwrap_or(false)
    })
}

/// Extracts the text of the document's `<title>` element.
#[must_use]
pub fn page_title(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>())
}
