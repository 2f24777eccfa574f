//! Client for the external Flaresolverr challenge-solver service.
//!
//! On a challenge page the scraper client delegates here: a
//! `{cmd: "request.get", url, session}` POST to `<host>/v1` returns a solved
//! page plus the cookies that passed the challenge. Those cookies are
//! installed into the shared jar and the original call is retried once with
//! its cache disabled.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::errors::CdlError;
use crate::http::challenge::is_challenge_page;
use crate::http::cookies::install_cookie;

/// Session name registered with the solver; persists across requests so the
/// solver can reuse its browser instance.
const SESSION_ID: &str = "cyberdrop-dl";

/// Per-command solver timeout in milliseconds (sent in the request body).
const SOLVER_MAX_TIMEOUT_MS: u64 = 60_000;

/// A solved page returned by the service.
#[derive(Debug, Clone)]
pub struct SolvedResponse {
    /// HTML of the solved page.
    pub html: String,
    /// Final URL after the solver's redirects.
    pub url: Url,
    /// User-Agent the solver's browser used.
    pub user_agent: String,
}

#[derive(Debug, Deserialize)]
struct SolverEnvelope {
    status: String,
    solution: Option<SolverSolution>,
}

#[derive(Debug, Deserialize)]
struct SolverSolution {
    response: String,
    url: String,
    #[serde(rename = "userAgent")]
    user_agent: String,
    #[serde(default)]
    cookies: Vec<SolverCookie>,
}

/// One cookie from the solver's `solution.cookies` array.
#[derive(Debug, Clone, Deserialize)]
pub struct SolverCookie {
    pub name: String,
    pub domain: String,
    pub value: String,
}

/// Handle to a (possibly unconfigured) Flaresolverr endpoint.
#[derive(Debug)]
pub struct Flaresolverr {
    host: Option<Url>,
    client: reqwest::Client,
    jar: Arc<Jar>,
    user_agent: String,
    session_id: Mutex<Option<String>>,
}

impl Flaresolverr {
    /// Creates a handle. `host` of `None` disables the bypass path.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the inner HTTP client cannot be built.
    pub fn new(
        host: Option<Url>,
        jar: Arc<Jar>,
        user_agent: impl Into<String>,
    ) -> Result<Self, CdlError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(60))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| CdlError::http("flaresolverr client", e))?;
        Ok(Self {
            host,
            client,
            jar,
            user_agent: user_agent.into(),
            session_id: Mutex::new(None),
        })
    }

    /// Whether a solver endpoint is configured.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.host.is_some()
    }

    async fn request(&self, command: &str, mut extra: Value) -> Result<Value, CdlError> {
        let Some(host) = &self.host else {
            return Err(CdlError::ddos_guard("FlareSolverr is not configured"));
        };

        let has_explicit_session = extra
            .as_object()
            .is_some_and(|map| map.contains_key("session"));
        if !has_explicit_session {
            Box::pin(self.ensure_session()).await?;
        }

        let mut body = json!({
            "cmd": command,
            "maxTimeout": SOLVER_MAX_TIMEOUT_MS,
        });
        if let (Some(body_map), Some(extra_map)) = (body.as_object_mut(), extra.as_object_mut()) {
            if !has_explicit_session {
                if let Some(session) = self.session_id.lock().await.clone() {
                    body_map.insert("session".to_string(), Value::String(session));
                }
            }
            body_map.append(extra_map);
        }

        let endpoint = host
            .join("v1")
            .map_err(|_| CdlError::ddos_guard("invalid flaresolverr host"))?;
        let response = self
            .client
            .post(endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| CdlError::http(endpoint.as_str(), e))?;
        response
            .json()
            .await
            .map_err(|e| CdlError::http(endpoint.as_str(), e))
    }

    async fn ensure_session(&self) -> Result<(), CdlError> {
        {
            let session = self.session_id.lock().await;
            if session.is_some() {
                return Ok(());
            }
        }
        let response = self
            .request("sessions.create", json!({ "session": SESSION_ID }))
            .await?;
        let status = response.get("status").and_then(Value::as_str);
        if status != Some("ok") {
            return Err(CdlError::ddos_guard("Failed to create flaresolverr session"));
        }
        *self.session_id.lock().await = Some(SESSION_ID.to_string());
        debug!(session = SESSION_ID, "flaresolverr session created");
        Ok(())
    }

    /// Destroys the solver session, if one was created.
    pub async fn destroy_session(&self) {
        let session = self.session_id.lock().await.take();
        if let Some(session) = session {
            let _ = self
                .request("sessions.destroy", json!({ "session": session }))
                .await;
        }
    }

    /// Resolves a challenged URL through the solver, installing the returned
    /// cookies into the shared jar.
    ///
    /// # Errors
    ///
    /// Returns [`CdlError::DdosGuard`] when the solver is unconfigured,
    /// returns an invalid payload, fails to solve, or solves with a
    /// User-Agent that differs from the configured one while the challenge
    /// persists.
    pub async fn get(&self, url: &Url) -> Result<SolvedResponse, CdlError> {
        let raw = self
            .request("request.get", json!({ "url": url.as_str() }))
            .await?;

        let envelope: SolverEnvelope = serde_json::from_value(raw)
            .map_err(|_| CdlError::ddos_guard("Invalid response from flaresolverr"))?;
        if envelope.status != "ok" {
            return Err(CdlError::ddos_guard(
                "Failed to resolve URL with flaresolverr",
            ));
        }
        let Some(solution) = envelope.solution else {
            return Err(CdlError::ddos_guard("Invalid response from flaresolverr"));
        };

        let solver_ua = solution.user_agent.trim().to_string();
        let config_ua = self.user_agent.trim();
        let mismatch_msg = format!(
            "Config user_agent and flaresolverr user_agent do not match: \
             \n  Cyberdrop-DL: {config_ua}\n  Flaresolverr: {solver_ua}"
        );

        let still_challenged = is_challenge_page(&solution.response);
        if still_challenged && solver_ua != config_ua {
            return Err(CdlError::ddos_guard(mismatch_msg));
        }
        if !still_challenged && solver_ua != config_ua {
            warn!("{mismatch_msg}\nResponse was successful but cookies will not be valid");
        }

        for cookie in &solution.cookies {
            install_cookie(&self.jar, &cookie.domain, &cookie.name, &cookie.value);
        }

        let resolved = Url::parse(&solution.url)
            .map_err(|_| CdlError::ddos_guard("Invalid response from flaresolverr"))?;
        Ok(SolvedResponse {
            html: solution.response,
            url: resolved,
            user_agent: solver_ua,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn solver(host: Option<&str>, jar: &Arc<Jar>) -> Flaresolverr {
        let host = host.map(|h| Url::parse(h).unwrap());
        Flaresolverr::new(host, Arc::clone(jar), "cyberdrop-dl/0.1.0").unwrap()
    }

    fn ok_payload(html: &str, ua: &str) -> serde_json::Value {
        json!({
            "status": "ok",
            "solution": {
                "response": html,
                "url": "https://example.host/album",
                "userAgent": ua,
                "cookies": [
                    {"name": "cf_clearance", "domain": ".example.host", "value": "solved"}
                ]
            }
        })
    }

    #[tokio::test]
    async fn test_unconfigured_solver_raises_ddos_guard() {
        let jar = Arc::new(Jar::default());
        let solver = solver(None, &jar);
        let url = Url::parse("https://example.host/album").unwrap();
        let err = solver.get(&url).await.unwrap_err();
        assert!(matches!(err, CdlError::DdosGuard { .. }));
        assert!(err.to_string().contains("not configured"));
    }

    #[tokio::test]
    async fn test_get_creates_session_and_installs_cookies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .and(body_partial_json(json!({"cmd": "sessions.create"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .and(body_partial_json(json!({"cmd": "request.get"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(ok_payload("<html><title>album</title></html>", "other-ua")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let jar = Arc::new(Jar::default());
        let solver = solver(Some(&server.uri()), &jar);
        let url = Url::parse("https://example.host/album").unwrap();
        let solved = solver.get(&url).await.unwrap();
        assert!(solved.html.contains("album"));
        assert_eq!(solved.url.as_str(), "https://example.host/album");

        use reqwest::cookie::CookieStore;
        let cookies = jar
            .cookies(&Url::parse("https://example.host/").unwrap())
            .unwrap();
        assert!(cookies.to_str().unwrap().contains("cf_clearance=solved"));
    }

    #[tokio::test]
    async fn test_persistent_challenge_with_ua_mismatch_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .and(body_partial_json(json!({"cmd": "sessions.create"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .and(body_partial_json(json!({"cmd": "request.get"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_payload(
                "<html><head><title>Just a moment...</title></head></html>",
                "mismatched-ua",
            )))
            .mount(&server)
            .await;

        let jar = Arc::new(Jar::default());
        let solver = solver(Some(&server.uri()), &jar);
        let url = Url::parse("https://example.host/album").unwrap();
        let err = solver.get(&url).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("do not match"), "unexpected message: {msg}");
        // The mismatch message must show both the config UA and the solver UA.
        assert!(msg.contains("cyberdrop-dl/0.1.0"), "missing config UA: {msg}");
        assert!(msg.contains("mismatched-ua"), "missing solver UA: {msg}");
    }

    #[tokio::test]
    async fn test_failed_solve_status_raises() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .and(body_partial_json(json!({"cmd": "sessions.create"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .and(body_partial_json(json!({"cmd": "request.get"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": "error"})),
            )
            .mount(&server)
            .await;

        let jar = Arc::new(Jar::default());
        let solver = solver(Some(&server.uri()), &jar);
        let url = Url::parse("https://example.host/album").unwrap();
        let err = solver.get(&url).await.unwrap_err();
        assert!(err.to_string().contains("Failed to resolve"));
    }

    #[tokio::test]
    async fn test_malformed_payload_raises_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .and(body_partial_json(json!({"cmd": "sessions.create"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .and(body_partial_json(json!({"cmd": "request.get"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "ok", "solution": {"bogus": true}})),
            )
            .mount(&server)
            .await;

        let jar = Arc::new(Jar::default());
        let solver = solver(Some(&server.uri()), &jar);
        let url = Url::parse("https://example.host/album").unwrap();
        let err = solver.get(&url).await.unwrap_err();
        assert!(err.to_string().contains("Invalid response"));
    }
}
