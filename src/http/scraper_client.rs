//! Cookie-jar-backed scraping session with response caching, status
//! classification, and the anti-bot escalation path.
//!
//! Every call acquires the request triple for the calling extractor's
//! domain. Successful text-like responses are served from and written to a
//! shared on-disk cache unless the caller disables it. On a challenge page
//! the URL is evicted from the cache and delegated to Flaresolverr; the
//! solved page satisfies the call directly, and if the solver's own response
//! is still challenged the original call is retried once with the cache
//! disabled. A second challenge is fatal.

use std::sync::Arc;

use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, ETAG};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::Settings;
use crate::errors::CdlError;
use crate::http::cache::ResponseCache;
use crate::http::challenge::is_challenge_page;
use crate::http::flaresolverr::Flaresolverr;
use crate::limits::RateLimitFabric;

/// ETags of known-dead placeholder content, mapped to their reason.
pub const DOWNLOAD_ERROR_ETAGS: &[(&str, &str)] = &[
    ("d835884373f4d6c8f24742ceabe74946", "Imgur image has been removed"),
    ("65b7753c-528a", "SC Scrape Image"),
    ("5c4fb843-ece", "PixHost Removed Image"),
];

/// Hosts whose error responses carry a JSON body worth probing.
const JSON_ERROR_HOSTS: &[&str] = &["gofile", "imgur"];

/// Per-call options for scraper requests.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Bypass the response cache for this call.
    pub cache_disabled: bool,
    /// Extra headers merged into the request.
    pub headers_extra: Vec<(String, String)>,
    /// Originating item URL, for log context.
    pub origin: Option<Url>,
}

/// Body kind the caller expects, used for content-type validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Markup,
    Json,
}

/// Scraping HTTP client shared by all extractors.
#[derive(Debug)]
pub struct ScraperClient {
    client: reqwest::Client,
    fabric: Arc<RateLimitFabric>,
    cache: Arc<ResponseCache>,
    solver: Arc<Flaresolverr>,
}

impl ScraperClient {
    /// Builds the scraping session over the shared cookie jar.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the HTTP client cannot be built.
    pub fn new(
        jar: Arc<Jar>,
        fabric: Arc<RateLimitFabric>,
        cache: Arc<ResponseCache>,
        solver: Arc<Flaresolverr>,
        settings: &Settings,
    ) -> Result<Self, CdlError> {
        let client = reqwest::Client::builder()
            .cookie_provider(jar)
            .user_agent(settings.general.user_agent.clone())
            .connect_timeout(settings.rate_limiting.connect_timeout())
            .timeout(settings.rate_limiting.total_timeout())
            .gzip(true)
            .build()
            .map_err(|e| CdlError::http("scraper client", e))?;
        Ok(Self {
            client,
            fabric,
            cache,
            solver,
        })
    }

    /// Fetches a URL and returns its HTML document text.
    ///
    /// # Errors
    ///
    /// Propagates classification errors; a challenge that survives one
    /// solver round trip is fatal.
    #[instrument(level = "debug", skip(self, options), fields(url = %url))]
    pub async fn get_soup(
        &self,
        domain: &str,
        url: &Url,
        options: &RequestOptions,
    ) -> Result<String, CdlError> {
        self.get_markup(domain, url, options.cache_disabled, &options.headers_extra, true)
            .await
    }

    /// Fetches a URL and returns its body as text.
    ///
    /// # Errors
    ///
    /// Same as [`get_soup`](Self::get_soup).
    pub async fn get_text(
        &self,
        domain: &str,
        url: &Url,
        options: &RequestOptions,
    ) -> Result<String, CdlError> {
        self.get_markup(domain, url, options.cache_disabled, &options.headers_extra, true)
            .await
    }

    /// Fetches a URL expecting a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`CdlError::InvalidContentType`] when the response is not
    /// JSON; challenge pages propagate as [`CdlError::DdosGuard`].
    #[instrument(level = "debug", skip(self, options), fields(url = %url))]
    pub async fn get_json(
        &self,
        domain: &str,
        url: &Url,
        options: &RequestOptions,
    ) -> Result<Value, CdlError> {
        if !options.cache_disabled {
            if let Some(hit) = self.cache.get(url.as_str()).await {
                validate_content_type(&hit.content_type, BodyKind::Json)?;
                return serde_json::from_slice(&hit.body)
                    .map_err(|e| CdlError::invalid_content_type(e.to_string()));
            }
        }

        let (headers, body) = self
            .fetch(domain, url, &options.headers_extra)
            .await?;
        let content_type = header_str(&headers, CONTENT_TYPE);
        validate_content_type(&content_type, BodyKind::Json)?;
        if !options.cache_disabled {
            self.cache.put(url.as_str(), &content_type, &body).await;
        }
        serde_json::from_slice(&body).map_err(|e| CdlError::invalid_content_type(e.to_string()))
    }

    /// Issues a HEAD request and returns the response headers.
    ///
    /// # Errors
    ///
    /// Propagates classification errors.
    pub async fn get_head(&self, domain: &str, url: &Url) -> Result<HeaderMap, CdlError> {
        let _permit = self.fabric.limiter(domain).await?;
        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| CdlError::http(url.as_str(), e))?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let host = response.url().host_str().unwrap_or_default().to_string();
        classify_response(status, &headers, &[], &host, false)?;
        Ok(headers)
    }

    /// POSTs a JSON payload and returns the parsed JSON response.
    ///
    /// # Errors
    ///
    /// Propagates classification errors; non-JSON responses raise
    /// [`CdlError::InvalidContentType`].
    pub async fn post_data(
        &self,
        domain: &str,
        url: &Url,
        data: &Value,
        options: &RequestOptions,
    ) -> Result<Value, CdlError> {
        let _permit = self.fabric.limiter(domain).await?;
        let mut request = self.client.post(url.clone()).json(data);
        request = apply_extra_headers(request, &options.headers_extra);
        let response = request
            .send()
            .await
            .map_err(|e| CdlError::http(url.as_str(), e))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let host = response.url().host_str().unwrap_or_default().to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| CdlError::http(url.as_str(), e))?;
        classify_response(status, &headers, &body, &host, false)?;
        serde_json::from_slice(&body).map_err(|e| CdlError::invalid_content_type(e.to_string()))
    }

    /// Shared markup path for `get_soup`/`get_text` with the single solver
    /// retry.
    fn get_markup<'a>(
        &'a self,
        domain: &'a str,
        url: &'a Url,
        cache_disabled: bool,
        headers_extra: &'a [(String, String)],
        retry: bool,
    ) -> futures_util::future::BoxFuture<'a, Result<String, CdlError>> {
        Box::pin(async move {
            if !cache_disabled {
                if let Some(hit) = self.cache.get(url.as_str()).await {
                    validate_content_type(&hit.content_type, BodyKind::Markup)?;
                    return Ok(String::from_utf8_lossy(&hit.body).into_owned());
                }
            }

            let result = self.fetch(domain, url, headers_extra).await;
            match result {
                Ok((headers, body)) => {
                    let content_type = header_str(&headers, CONTENT_TYPE);
                    validate_content_type(&content_type, BodyKind::Markup)?;
                    if !cache_disabled {
                        self.cache.put(url.as_str(), &content_type, &body).await;
                    }
                    Ok(String::from_utf8_lossy(&body).into_owned())
                }
                Err(CdlError::DdosGuard { .. }) => {
                    self.cache.evict(url.as_str()).await;
                    let solved = self.solver.get(url).await?;
                    if is_challenge_page(&solved.html) {
                        if !retry {
                            return Err(CdlError::ddos_guard(
                                "Unable to access website with flaresolverr cookies",
                            ));
                        }
                        debug!(url = %url, "challenge persists, retrying with solver cookies");
                        return self
                            .get_markup(domain, url, true, headers_extra, false)
                            .await;
                    }
                    Ok(solved.html)
                }
                Err(error) => Err(error),
            }
        })
    }

    /// Sends a GET under the request triple and classifies the response.
    async fn fetch(
        &self,
        domain: &str,
        url: &Url,
        headers_extra: &[(String, String)],
    ) -> Result<(HeaderMap, Vec<u8>), CdlError> {
        let _permit = self.fabric.limiter(domain).await?;
        let mut request = self.client.get(url.clone());
        request = apply_extra_headers(request, headers_extra);
        let response = request
            .send()
            .await
            .map_err(|e| CdlError::http(url.as_str(), e))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let host = response.url().host_str().unwrap_or_default().to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| CdlError::http(url.as_str(), e))?
            .to_vec();
        classify_response(status, &headers, &body, &host, false)?;
        Ok((headers, body))
    }
}

/// Runs status classification over a finished response.
///
/// Order matters: the dead-content ETag table is download-only, 2xx/3xx pass
/// through, JSON-shaped errors are probed for gofile/imgur, challenge
/// markers map to `DdosGuard`, and everything else becomes a `Download`
/// error (with the teapot code when the content-type header is missing).
///
/// # Errors
///
/// Returns the classification described above.
pub fn classify_response(
    status: u16,
    headers: &HeaderMap,
    body: &[u8],
    host: &str,
    download: bool,
) -> Result<(), CdlError> {
    if download {
        if let Some(etag) = headers.get(ETAG).and_then(|v| v.to_str().ok()) {
            let etag = etag.trim_matches('"');
            if let Some((_, reason)) = DOWNLOAD_ERROR_ETAGS
                .iter()
                .find(|(known, _)| *known == etag)
            {
                return Err(CdlError::download(404, *reason));
            }
        }
    }

    if (200..400).contains(&status) {
        return Ok(());
    }

    if JSON_ERROR_HOSTS.iter().any(|h| host.contains(h)) {
        if let Ok(json) = serde_json::from_slice::<Value>(body) {
            if let Some(status_str) = json.get("status").and_then(Value::as_str) {
                if status_str.contains("notFound") {
                    return Err(CdlError::scrape(404, "not found"));
                }
                if let Some(error) = json
                    .get("data")
                    .and_then(|data| data.get("error"))
                    .and_then(Value::as_str)
                {
                    return Err(CdlError::scrape(status_str.to_string(), error));
                }
            }
        }
    }

    if let Ok(text) = std::str::from_utf8(body) {
        if is_challenge_page(text) {
            return Err(CdlError::ddos_guard("challenge page detected"));
        }
    }

    if headers.get(CONTENT_TYPE).is_none() {
        return Err(CdlError::download(418, "No content-type in response header"));
    }
    Err(CdlError::download(status, format!("HTTP {status}")))
}

fn validate_content_type(content_type: &str, kind: BodyKind) -> Result<(), CdlError> {
    let lowered = content_type.to_ascii_lowercase();
    let ok = match kind {
        BodyKind::Markup => lowered.contains("html") || lowered.contains("text"),
        BodyKind::Json => lowered.contains("json"),
    };
    if ok {
        Ok(())
    } else {
        let expected = match kind {
            BodyKind::Markup => "text",
            BodyKind::Json => "JSON",
        };
        Err(CdlError::invalid_content_type(format!(
            "Received {content_type}, was expecting {expected}"
        )))
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn apply_extra_headers(
    mut request: reqwest::RequestBuilder,
    headers_extra: &[(String, String)],
) -> reqwest::RequestBuilder {
    for (name, value) in headers_extra {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => request = request.header(name, value),
            _ => warn!(header = %name, "skipping invalid extra header"),
        }
    }
    request
}
