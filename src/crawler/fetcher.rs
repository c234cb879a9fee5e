//! HTTP fetcher implementation
//!
//! This module handles all source requests, including:
//! - Building the HTTP client with default headers and user agent
//! - Per-host rate limiting before every network attempt
//! - Circuit-breaker admission and outcome reporting
//! - Retry with exponential backoff for transient failures
//! - Bot-challenge detection and escalation to the fallback renderer
//! - An optional in-memory response cache

use crate::config::{Settings, Source};
use crate::crawler::browser::PageRenderer;
use crate::crawler::coordinator::SourceContext;
use crate::crawler::rate_limiter::RateLimiter;
use crate::crawler::retry::RetryPolicy;
use crate::state::Admission;
use crate::{FetchError, HarvestError};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, RETRY_AFTER, USER_AGENT};
use reqwest::{redirect::Policy, Client, StatusCode};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

/// User agent sent when no rotation list is configured
pub const DEFAULT_USER_AGENT: &str = concat!(
    "InsiderHarvest/",
    env!("CARGO_PKG_VERSION"),
    " (+respectful scraper)"
);

/// Lowercase body fragments that identify anti-automation pages
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-chl",
    "challenge-platform",
    "cf-browser-verification",
    "captcha",
    "attention required",
    "just a moment...",
    "ddos protection",
];

/// Page content handed from the fetch stage to the parser
#[derive(Debug, Clone)]
pub struct RawPage {
    /// Response body or rendered DOM
    pub content: String,

    /// HTTP status, or None when rendered via the browser fallback
    pub status: Option<u16>,

    /// URL after redirects
    pub final_url: String,

    /// Time spent producing the content
    pub latency: Duration,
}

impl RawPage {
    /// Returns true if the browser fallback produced this page
    pub fn rendered(&self) -> bool {
        self.status.is_none()
    }

    /// Hex-encoded SHA-256 of the content
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// A resolved request for one source page
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source_name: String,
    pub url: Url,

    /// Table the page must contain; renderers wait for it
    pub table_id: String,
}

/// Classification of a completed HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Challenge(String),
    Transient(String),
    Permanent,
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `settings` - Resolved settings (timeouts come from the scraper section)
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(settings: &Settings) -> Result<Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

    let timeout = settings.scraper.request_timeout();
    Client::builder()
        .user_agent(DEFAULT_USER_AGENT)
        .default_headers(headers)
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Returns the rate-limiter key for a URL (its host and port)
pub fn limiter_key(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => url.as_str().to_string(),
    }
}

/// Classifies a response by status, final URL and body
///
/// # Classification
///
/// | Condition | Class |
/// |-----------|-------|
/// | HTTP 403 | Challenge |
/// | Redirected to a challenge/captcha path | Challenge |
/// | 2xx or 5xx body with challenge markers and no target table | Challenge |
/// | 2xx | Success |
/// | 5xx, 429, 408 | Transient |
/// | Anything else | Permanent |
pub fn classify_response(status: StatusCode, final_url: &Url, body: &str, table_id: &str) -> ResponseClass {
    if status == StatusCode::FORBIDDEN {
        return ResponseClass::Challenge("HTTP 403".to_string());
    }

    let path = final_url.path().to_ascii_lowercase();
    if path.contains("challenge") || path.contains("captcha") {
        return ResponseClass::Challenge(format!("redirected to {}", final_url.path()));
    }

    if (status.is_success() || status.is_server_error()) && looks_like_challenge(body, table_id) {
        return ResponseClass::Challenge("challenge markers in response body".to_string());
    }

    if status.is_success() {
        ResponseClass::Success
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ResponseClass::Transient(format!("HTTP {}", status.as_u16()))
    } else {
        ResponseClass::Permanent
    }
}

fn looks_like_challenge(body: &str, table_id: &str) -> bool {
    if body.contains(table_id) {
        return false;
    }
    let lower = body.to_lowercase();
    CHALLENGE_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Parses a `Retry-After` header given in seconds
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Short-lived cache of successful primary responses, keyed by URL
#[derive(Debug)]
struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, RawPage)>>,
}

impl ResponseCache {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, url: &str) -> Option<RawPage> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(url) {
            Some((stored_at, page)) if stored_at.elapsed() < self.ttl => Some(page.clone()),
            Some(_) => {
                entries.remove(url);
                None
            }
            None => None,
        }
    }

    fn put(&self, url: &str, page: &RawPage) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(url.to_string(), (Instant::now(), page.clone()));
    }
}

/// Fetches source pages through the rate limiter, breaker and retry policy
pub struct PrimaryFetcher {
    client: Client,
    base_url: Url,
    table_id: String,
    user_agents: Vec<String>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    renderer: Arc<dyn PageRenderer>,
    cache: Option<ResponseCache>,
}

impl PrimaryFetcher {
    /// Creates a fetcher from resolved settings
    ///
    /// # Arguments
    ///
    /// * `settings` - Resolved settings
    /// * `renderer` - Fallback used for bot-challenged pages
    pub fn new(settings: &Settings, renderer: Arc<dyn PageRenderer>) -> Result<Self, HarvestError> {
        let scraper = &settings.scraper;
        let caching = &settings.advanced.caching;

        Ok(Self {
            client: build_http_client(settings)?,
            base_url: Url::parse(&scraper.base_url)?,
            table_id: scraper.table_id.clone(),
            user_agents: scraper.user_agents.clone(),
            limiter: RateLimiter::new(scraper.request_delay()),
            retry: RetryPolicy::from_config(scraper),
            renderer,
            cache: caching
                .enabled
                .then(|| ResponseCache::new(Duration::from_secs(caching.expire_after))),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Builds the request for a source page with the given row limit
    pub fn request_for(&self, source: &Source, row_limit: u32) -> Result<FetchRequest, FetchError> {
        let mut url = self
            .base_url
            .join(&source.url_path)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", source.url_path, e)))?;
        url.query_pairs_mut()
            .append_pair("maxrows", &row_limit.to_string());

        Ok(FetchRequest {
            source_name: source.name.clone(),
            url,
            table_id: self.table_id.clone(),
        })
    }

    /// Fetches a source page
    ///
    /// # Request Flow
    ///
    /// 1. Serve from the response cache when enabled and fresh
    /// 2. Ask the source's breaker for admission (short-circuit if open)
    /// 3. Acquire the rate limiter, send, classify; retry transient failures
    /// 4. Escalate bot challenges to the fallback renderer
    /// 5. Report the final outcome to the breaker
    ///
    /// # Arguments
    ///
    /// * `ctx` - The source's context (breaker and limiter key)
    /// * `row_limit` - Rows to request
    /// * `cancel` - Stops waiting between retries
    pub async fn fetch(
        &self,
        ctx: &SourceContext,
        row_limit: u32,
        cancel: &CancellationToken,
    ) -> Result<RawPage, FetchError> {
        let request = self.request_for(&ctx.source, row_limit)?;

        if let Some(page) = self.cache.as_ref().and_then(|c| c.get(request.url.as_str())) {
            tracing::debug!(source = %ctx.source.name, "Serving page from response cache");
            return Ok(page);
        }

        let admission = ctx
            .breaker
            .try_acquire()
            .map_err(|retry_in| FetchError::CircuitOpen {
                source_name: ctx.source.name.clone(),
                retry_in,
            })?;
        if admission == Admission::Probe {
            tracing::info!(source = %ctx.source.name, "Sending half-open probe");
        }

        let result = match self.fetch_with_retry(ctx, &request, cancel).await {
            Err(FetchError::Blocked { reason, .. }) => {
                tracing::warn!(
                    source = %ctx.source.name,
                    reason = %reason,
                    "Bot challenge on primary transport, escalating to fallback renderer"
                );
                self.renderer.render(&request).await
            }
            other => other,
        };

        match &result {
            Ok(page) => {
                ctx.breaker.record_success();
                if let (Some(cache), false) = (&self.cache, page.rendered()) {
                    cache.put(request.url.as_str(), page);
                }
            }
            Err(FetchError::Cancelled { .. }) => ctx.breaker.release_probe(),
            Err(_) => ctx.breaker.record_failure(),
        }

        result
    }

    async fn fetch_with_retry(
        &self,
        ctx: &SourceContext,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Result<RawPage, FetchError> {
        let mut attempt = 0;

        loop {
            self.limiter.acquire(&ctx.limiter_key).await;

            let error = match self.send_once(request).await {
                Ok(page) => return Ok(page),
                Err(error) => error,
            };

            let retry_after = match &error {
                FetchError::Transient { retry_after, .. } => *retry_after,
                _ => None,
            };

            let Some(delay) = self.retry.should_retry(attempt, error.kind(), retry_after) else {
                return Err(with_attempts(error, attempt + 1));
            };

            tracing::warn!(
                source = %ctx.source.name,
                attempt = attempt + 1,
                ?delay,
                error = %error,
                "Transient fetch failure, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(FetchError::Cancelled { url: request.url.to_string() });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn send_once(&self, request: &FetchRequest) -> Result<RawPage, FetchError> {
        let url = request.url.to_string();
        let started = Instant::now();

        let mut builder = self.client.get(request.url.clone());
        if let Some(agent) = self.pick_user_agent() {
            builder = builder.header(USER_AGENT, agent);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport_error(&url, &e))?;

        let status = response.status();
        let final_url = response.url().clone();
        let retry_after = parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(&url, &e))?;

        tracing::debug!(
            source = %request.source_name,
            status = status.as_u16(),
            bytes = body.len(),
            elapsed = ?started.elapsed(),
            "Response received"
        );

        match classify_response(status, &final_url, &body, &request.table_id) {
            ResponseClass::Success => Ok(RawPage {
                content: body,
                status: Some(status.as_u16()),
                final_url: final_url.to_string(),
                latency: started.elapsed(),
            }),
            ResponseClass::Challenge(reason) => Err(FetchError::Blocked { url, reason }),
            ResponseClass::Transient(reason) => Err(FetchError::Transient {
                url,
                reason,
                attempts: 1,
                retry_after,
            }),
            ResponseClass::Permanent => Err(FetchError::Permanent {
                url,
                status: status.as_u16(),
            }),
        }
    }

    fn pick_user_agent(&self) -> Option<&str> {
        if self.user_agents.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..self.user_agents.len());
        Some(self.user_agents[index].as_str())
    }
}

/// Maps a reqwest transport error onto the failure taxonomy
fn classify_transport_error(url: &str, error: &reqwest::Error) -> FetchError {
    if error.is_redirect() {
        return FetchError::Blocked {
            url: url.to_string(),
            reason: "redirect loop".to_string(),
        };
    }

    let reason = if error.is_timeout() {
        "request timeout".to_string()
    } else if error.is_connect() {
        "connection failed".to_string()
    } else {
        error.to_string()
    };

    FetchError::Transient {
        url: url.to_string(),
        reason,
        attempts: 1,
        retry_after: None,
    }
}

fn with_attempts(error: FetchError, attempts: u32) -> FetchError {
    match error {
        FetchError::Transient {
            url,
            reason,
            retry_after,
            ..
        } => FetchError::Transient {
            url,
            reason,
            attempts,
            retry_after,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::browser::DisabledRenderer;
    use crate::crawler::breaker::CircuitBreaker;
    use crate::state::CircuitState;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TABLE_PAGE: &str = r#"<html><body><table id="insidertrades"><tr><th>Ticker</th></tr><tr><td>AAPL</td></tr></table></body></html>"#;

    fn create_test_settings(base_url: &str) -> Settings {
        let mut settings = Settings::default();
        settings.scraper.base_url = base_url.to_string();
        settings.scraper.request_delay = 0.0;
        settings.scraper.retry_delay_base = 0.01;
        settings.scraper.max_retries = 2;
        settings.scraper.request_timeout = 5;
        settings
    }

    fn create_test_source() -> Source {
        Source {
            name: "latest_filings".to_string(),
            url_path: "/latest-insider-trading".to_string(),
            enabled: true,
            row_limit: 100,
        }
    }

    fn create_test_context(fetcher: &PrimaryFetcher, threshold: u32) -> SourceContext {
        let source = create_test_source();
        SourceContext {
            breaker: CircuitBreaker::new(&source.name, threshold, Duration::from_secs(60)),
            limiter_key: limiter_key(fetcher.base_url()),
            job_lock: tokio::sync::Mutex::new(()),
            source,
        }
    }

    fn create_test_fetcher(settings: &Settings) -> PrimaryFetcher {
        PrimaryFetcher::new(settings, Arc::new(DisabledRenderer)).unwrap()
    }

    #[test]
    fn test_build_http_client() {
        assert!(build_http_client(&Settings::default()).is_ok());
    }

    #[test]
    fn test_request_url_includes_row_limit() {
        let fetcher = create_test_fetcher(&Settings::default());
        let request = fetcher.request_for(&create_test_source(), 20).unwrap();
        assert_eq!(
            request.url.as_str(),
            "http://openinsider.com/latest-insider-trading?maxrows=20"
        );
        assert_eq!(request.table_id, "insidertrades");
    }

    #[test]
    fn test_limiter_key() {
        let url = Url::parse("http://127.0.0.1:8080/x").unwrap();
        assert_eq!(limiter_key(&url), "127.0.0.1:8080");
        let url = Url::parse("http://openinsider.com/x").unwrap();
        assert_eq!(limiter_key(&url), "openinsider.com");
    }

    #[test]
    fn test_classify_response() {
        let url = Url::parse("http://openinsider.com/latest-insider-trading").unwrap();

        assert_eq!(
            classify_response(StatusCode::OK, &url, TABLE_PAGE, "insidertrades"),
            ResponseClass::Success
        );
        assert!(matches!(
            classify_response(StatusCode::FORBIDDEN, &url, "", "insidertrades"),
            ResponseClass::Challenge(_)
        ));
        assert!(matches!(
            classify_response(StatusCode::SERVICE_UNAVAILABLE, &url, "busy", "insidertrades"),
            ResponseClass::Transient(_)
        ));
        assert!(matches!(
            classify_response(StatusCode::TOO_MANY_REQUESTS, &url, "", "insidertrades"),
            ResponseClass::Transient(_)
        ));
        assert_eq!(
            classify_response(StatusCode::NOT_FOUND, &url, "", "insidertrades"),
            ResponseClass::Permanent
        );
    }

    #[test]
    fn test_classify_challenge_pages() {
        let url = Url::parse("http://openinsider.com/latest-insider-trading").unwrap();
        let challenge = "<html><title>Just a moment...</title><div id=\"cf-chl-widget\"></div></html>";
        assert!(matches!(
            classify_response(StatusCode::OK, &url, challenge, "insidertrades"),
            ResponseClass::Challenge(_)
        ));
        assert!(matches!(
            classify_response(StatusCode::SERVICE_UNAVAILABLE, &url, challenge, "insidertrades"),
            ResponseClass::Challenge(_)
        ));

        let redirected = Url::parse("http://openinsider.com/cdn-cgi/challenge-platform/h/b").unwrap();
        assert!(matches!(
            classify_response(StatusCode::OK, &redirected, "", "insidertrades"),
            ResponseClass::Challenge(_)
        ));

        // Pages carrying the table are never challenges, whatever else they mention
        let with_table = format!("{}<p>captcha</p>", TABLE_PAGE);
        assert_eq!(
            classify_response(StatusCode::OK, &url, &with_table, "insidertrades"),
            ResponseClass::Success
        );
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest-insider-trading"))
            .and(query_param("maxrows", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_string(TABLE_PAGE))
            .mount(&server)
            .await;

        let fetcher = create_test_fetcher(&create_test_settings(&server.uri()));
        let ctx = create_test_context(&fetcher, 3);
        let page = fetcher
            .fetch(&ctx, 100, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(page.status, Some(200));
        assert!(page.content.contains("insidertrades"));
        assert!(!page.rendered());
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/latest-insider-trading"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/latest-insider-trading"))
            .respond_with(ResponseTemplate::new(200).set_body_string(TABLE_PAGE))
            .mount(&server)
            .await;

        let fetcher = create_test_fetcher(&create_test_settings(&server.uri()));
        let ctx = create_test_context(&fetcher, 3);
        let page = fetcher.fetch(&ctx, 100, &CancellationToken::new()).await;

        assert!(page.is_ok());
        assert_eq!(ctx.breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = create_test_fetcher(&create_test_settings(&server.uri()));
        let ctx = create_test_context(&fetcher, 3);
        let result = fetcher.fetch(&ctx, 100, &CancellationToken::new()).await;

        match result {
            Err(FetchError::Transient { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected transient failure, got {:?}", other),
        }
        assert_eq!(ctx.breaker.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_fetch_does_not_retry_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = create_test_fetcher(&create_test_settings(&server.uri()));
        let ctx = create_test_context(&fetcher, 3);
        let result = fetcher.fetch(&ctx, 100, &CancellationToken::new()).await;

        assert!(matches!(result, Err(FetchError::Permanent { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_blocked_without_fallback_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = create_test_fetcher(&create_test_settings(&server.uri()));
        let ctx = create_test_context(&fetcher, 3);
        let result = fetcher.fetch(&ctx, 100, &CancellationToken::new()).await;

        assert!(matches!(result, Err(FetchError::Blocked { .. })));
        assert_eq!(result.unwrap_err().kind(), crate::FailureKind::Blocked);
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = create_test_fetcher(&create_test_settings(&server.uri()));
        let ctx = create_test_context(&fetcher, 1);
        let cancel = CancellationToken::new();

        let _ = fetcher.fetch(&ctx, 100, &cancel).await;
        assert_eq!(ctx.breaker.snapshot().state, CircuitState::Open);

        // No request reaches the server while open; `expect(1)` verifies on drop
        let result = fetcher.fetch(&ctx, 100, &cancel).await;
        assert!(matches!(result, Err(FetchError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_response_cache_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(TABLE_PAGE))
            .expect(1)
            .mount(&server)
            .await;

        let mut settings = create_test_settings(&server.uri());
        settings.advanced.caching.enabled = true;
        let fetcher = create_test_fetcher(&settings);
        let ctx = create_test_context(&fetcher, 3);
        let cancel = CancellationToken::new();

        let first = fetcher.fetch(&ctx, 100, &cancel).await.unwrap();
        let second = fetcher.fetch(&ctx, 100, &cancel).await.unwrap();
        assert_eq!(first.content, second.content);
    }

    #[tokio::test]
    async fn test_retry_after_header_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
    }
}
