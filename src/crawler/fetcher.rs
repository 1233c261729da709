//! HTTP fetcher implementation
//!
//! This module handles all page fetches for the crawler, including:
//! - Building the HTTP client with the configured user agent
//! - Admission through the rate controller, one permit per attempt
//! - Retry with bounded backoff for transient failures
//! - Turning a response into a `PageFact` and candidate links
//! - Escalating JavaScript-dependent pages to the browser pool

use crate::config::Config;
use crate::crawler::browser::{BrowserError, BrowserPool};
use crate::crawler::parser::{parse_html, ParsedPage};
use crate::crawler::spa::SpaClassifier;
use crate::model::{FetchMethod, PageFact, RunId};
use crate::rate::RateController;
use crate::url::normalize_url;
use reqwest::{redirect::Policy, Client, StatusCode};
use std::collections::{BTreeSet, HashSet};
use std::error::Error as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Fetch failure taxonomy
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// Timeout, connection reset, 5xx or 429 on every attempt
    #[error("transient failure after {attempts} attempt(s): {message}")]
    Transient {
        attempts: u32,
        status: Option<u16>,
        message: String,
    },

    /// Not retried: DNS/TLS failures, refused connections, unreadable bodies
    #[error("permanent failure: {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },

    /// Browser path only; the page is not sent to the browser again this run
    #[error("render timed out after {timeout_ms}ms")]
    RenderTimeout { timeout_ms: u64 },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transient { status, .. } | Self::Permanent { status, .. } => *status,
            Self::RenderTimeout { .. } => None,
        }
    }
}

/// Bounded retry schedule for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after attempt `n` (1-based) is `delays[n - 1]`, last value repeats
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(7),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let index = (attempt.saturating_sub(1) as usize).min(self.delays.len().saturating_sub(1));
        self.delays.get(index).copied().unwrap_or_default()
    }
}

/// A response that was not retried away
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Final URL after redirects
    pub final_url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    /// Body, read only for HTML responses
    pub body: Option<String>,
    pub attempts: u32,
}

impl HttpResponse {
    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false)
    }
}

/// Builds an HTTP client with proper configuration
///
/// # Example
///
/// ```no_run
/// use seo_auditor::config::load_config;
/// use seo_auditor::crawler::build_http_client;
/// use std::path::Path;
///
/// let config = load_config(Path::new("auditor.toml")).unwrap();
/// let client = build_http_client(&config).unwrap();
/// ```
pub fn build_http_client(config: &Config) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.header_value())
        .timeout(Duration::from_secs(config.crawler.request_timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

enum Attempt {
    Done(HttpResponse),
    Retry { status: Option<u16>, message: String },
    Fail(FetchError),
}

/// HTTP fetcher gated by the rate controller
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    rate: RateController,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(client: Client, rate: RateController, retry: RetryPolicy) -> Self {
        Self {
            client,
            rate,
            retry,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Fetches a URL with retry logic
    ///
    /// # Retry Logic
    ///
    /// | Condition | Action |
    /// |-----------|--------|
    /// | HTTP 429 / 5xx | Retry with backoff |
    /// | Timeout / connection reset | Retry with backoff |
    /// | Any other status | Returned as-is |
    /// | Other network errors | Permanent |
    ///
    /// Each attempt waits for its own rate-controller permit, so retries
    /// count against the host's rate like any other request.
    pub async fn fetch(&self, url: &Url, host: &str) -> Result<HttpResponse, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_status = None;
        let mut last_message = String::new();

        for attempt in 1..=max_attempts {
            let outcome = {
                let _permit = self.rate.acquire(host).await;
                self.attempt(url, attempt).await
            };

            match outcome {
                Attempt::Done(response) => return Ok(response),
                Attempt::Fail(e) => return Err(e),
                Attempt::Retry { status, message } => {
                    tracing::debug!(
                        "Attempt {}/{} for {} failed: {}",
                        attempt,
                        max_attempts,
                        url,
                        message
                    );
                    last_status = status;
                    last_message = message;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.delay_after(attempt)).await;
                    }
                }
            }
        }

        Err(FetchError::Transient {
            attempts: max_attempts,
            status: last_status,
            message: last_message,
        })
    }

    async fn attempt(&self, url: &Url, attempt: u32) -> Attempt {
        let response = match self.client.get(url.as_str()).send().await {
            Ok(r) => r,
            Err(e) if is_transient(&e) => {
                return Attempt::Retry {
                    status: None,
                    message: e.to_string(),
                }
            }
            Err(e) => {
                return Attempt::Fail(FetchError::Permanent {
                    status: None,
                    message: e.to_string(),
                })
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Attempt::Retry {
                status: Some(status.as_u16()),
                message: format!("HTTP {}", status.as_u16()),
            };
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let mut result = HttpResponse {
            final_url,
            status: status.as_u16(),
            content_type,
            body: None,
            attempts: attempt,
        };

        if result.is_html() {
            match response.text().await {
                Ok(body) => result.body = Some(body),
                Err(e) if is_transient(&e) => {
                    return Attempt::Retry {
                        status: Some(status.as_u16()),
                        message: e.to_string(),
                    }
                }
                Err(e) => {
                    return Attempt::Fail(FetchError::Permanent {
                        status: Some(status.as_u16()),
                        message: format!("unreadable body: {}", e),
                    })
                }
            }
        }

        Attempt::Done(result)
    }
}

/// Timeouts and connection resets are retried; other transport errors are not
fn is_transient(error: &reqwest::Error) -> bool {
    if error.is_timeout() {
        return true;
    }

    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::TimedOut
            ) {
                return true;
            }
        }
        if cause.to_string().contains("connection closed before message completed") {
            return true;
        }
        source = cause.source();
    }
    false
}

/// Result of fetching one page
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub fact: PageFact,
    /// Normalized candidate links, deduplicated and sorted
    pub links: Vec<String>,
}

/// One page to fetch
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub run_id: RunId,
    pub url: Url,
    pub host: String,
    pub depth: u32,
}

/// HTTP-first page fetcher with browser escalation
pub struct Fetcher {
    http: HttpFetcher,
    spa: Arc<SpaClassifier>,
    browser: Option<Arc<BrowserPool>>,
    /// Pages whose render timed out; never sent to the browser again
    render_timeouts: Mutex<HashSet<String>>,
}

impl Fetcher {
    pub fn new(
        http: HttpFetcher,
        spa: Arc<SpaClassifier>,
        browser: Option<Arc<BrowserPool>>,
    ) -> Self {
        Self {
            http,
            spa,
            browser,
            render_timeouts: Mutex::new(HashSet::new()),
        }
    }

    pub fn http(&self) -> &HttpFetcher {
        &self.http
    }

    fn render_timed_out(&self, url: &str) -> bool {
        self.render_timeouts
            .lock()
            .map(|set| set.contains(url))
            .unwrap_or(false)
    }

    fn mark_render_timeout(&self, url: &str) {
        if let Ok(mut set) = self.render_timeouts.lock() {
            set.insert(url.to_string());
        }
    }

    /// Fetches one page and produces its fact and candidate links
    ///
    /// Fetch failures are recorded on the fact (`fetch_error`) rather than
    /// returned, so every dispatched URL yields exactly one fact.
    pub async fn fetch_page(&self, request: &PageRequest) -> FetchOutcome {
        let url_str = request.url.as_str();
        let mut fact = PageFact::empty(request.run_id, url_str, &request.host, request.depth);

        let response = match self.http.fetch(&request.url, &request.host).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Fetch failed for {}: {}", url_str, e);
                fact.status_code = e.status();
                fact.fetch_error = Some(e.to_string());
                return FetchOutcome {
                    fact,
                    links: Vec::new(),
                };
            }
        };

        fact.status_code = Some(response.status);
        fact.content_type = response.content_type.clone();

        let Some(body) = response.body.as_deref() else {
            // Non-HTML responses are recorded without parsing
            return FetchOutcome {
                fact,
                links: Vec::new(),
            };
        };

        let parsed = parse_html(body, &response.final_url);
        let mut links = parsed.links.clone();
        apply_parsed(&mut fact, &parsed);

        let decision = self.spa.classify(&request.host, body, parsed.text_length);
        if decision.needs_browser() {
            fact.js_required = true;
            if let Some(signal) = &decision.signal {
                tracing::debug!("{} needs the browser: {}", url_str, signal);
            }
            if let Some(browser) = &self.browser {
                if self.render_timed_out(url_str) {
                    fact.render_timeout = true;
                } else {
                    match browser.render(url_str).await {
                        Ok(html) => {
                            let rendered = parse_html(&html, &response.final_url);
                            self.spa.record_browser_result(
                                &request.host,
                                parsed.word_count,
                                rendered.word_count,
                            );
                            apply_parsed(&mut fact, &rendered);
                            fact.fetch_method = FetchMethod::Browser;
                            links.extend(rendered.links);
                        }
                        Err(BrowserError::Timeout { timeout_ms }) => {
                            tracing::warn!(
                                "{} for {}",
                                FetchError::RenderTimeout { timeout_ms },
                                url_str
                            );
                            fact.render_timeout = true;
                            self.mark_render_timeout(url_str);
                        }
                        Err(e) => {
                            tracing::warn!("Browser render failed for {}: {}", url_str, e);
                        }
                    }
                }
            }
        }

        FetchOutcome {
            fact,
            links: normalize_links(links),
        }
    }
}

fn apply_parsed(fact: &mut PageFact, parsed: &ParsedPage) {
    fact.title = parsed.title.clone();
    fact.meta = parsed.meta.clone();
    fact.headings = parsed.headings.clone();
    fact.canonical = parsed
        .canonical
        .as_deref()
        .and_then(|c| normalize_url(c).ok())
        .map(|u| u.to_string());
    fact.hreflang = parsed.hreflang.clone();
    fact.word_count = parsed.word_count;
    fact.text_density = parsed.text_density;
}

fn normalize_links(links: Vec<String>) -> Vec<String> {
    links
        .iter()
        .filter_map(|l| normalize_url(l).ok())
        .map(|u| u.to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
