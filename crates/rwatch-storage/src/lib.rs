//! Durable table storage + HTTP fetch utilities for RWATCH.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod tables;

pub use tables::{store_slug, StoreError, StoredTable, TableStore};

pub const CRATE_NAME: &str = "rwatch-storage";

/// Statuses worth another attempt: rate limiting and server-side failures.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Retry budget for idempotent requests.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Doubling delay before retry number `retry` (zero-based), capped at `max_delay`.
    pub fn delay_before(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry).unwrap_or(u32::MAX).min(31);
        self.base_delay.saturating_mul(1u32 << doublings).min(self.max_delay)
    }

    /// Webhook posts are not idempotent and get a single attempt.
    pub fn retries_for(&self, method: HttpMethod) -> usize {
        match method {
            HttpMethod::Get => self.max_retries,
            HttpMethod::Post => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// In-flight requests across every source.
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 6,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

/// Burst of `burst` requests, then one more every `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub interval: Duration,
}

impl RateLimit {
    pub fn per_minute(per_minute: u32) -> Option<Self> {
        if per_minute == 0 {
            return None;
        }
        Some(Self {
            burst: per_minute,
            interval: Duration::from_secs(60) / per_minute,
        })
    }
}

/// Search endpoints meter requests per minute; this keeps a run under the quota.
#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    credit: Mutex<(u32, Instant)>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            credit: Mutex::new((limit.burst, Instant::now())),
        }
    }

    /// Waits until a request may go out and spends one credit.
    pub async fn acquire(&self) {
        let mut credit = self.credit.lock().await;
        let (available, since) = *credit;
        let earned = if self.limit.interval.is_zero() {
            self.limit.burst
        } else {
            let earned = since.elapsed().as_nanos() / self.limit.interval.as_nanos();
            u32::try_from(earned).unwrap_or(u32::MAX)
        };
        let available = available.saturating_add(earned).min(self.limit.burst);
        let since = if earned > 0 { Instant::now() } else { since };

        if available > 0 {
            *credit = (available - 1, since);
            return;
        }
        let ready_at = since + self.limit.interval;
        tokio::time::sleep_until(ready_at).await;
        // The credit earned while sleeping is spent by this request.
        *credit = (0, Instant::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Method, target and payload of one outbound call; rebuilt per attempt.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub bearer_token: Option<String>,
    pub json_body: Option<JsonValue>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            bearer_token: None,
            json_body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            method: HttpMethod::Post,
            json_body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn bearer(mut self, token: Option<String>) -> Self {
        self.bearer_token = token.filter(|t| !t.trim().is_empty());
        self
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    rate_limiter: Option<RateLimiter>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            in_flight: Semaphore::new(config.concurrency.max(1)),
            rate_limiter: config.rate_limit.map(RateLimiter::new),
            backoff: config.backoff,
        })
    }

    fn build(&self, request: &HttpRequest) -> reqwest::RequestBuilder {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.json_body {
            builder = builder.json(body);
        }
        builder
    }

    /// Sends `request` within the concurrency and rate limits and returns the
    /// body of a 2xx response. GETs are retried on transient failures.
    pub async fn send(
        &self,
        run_id: Uuid,
        source_id: &str,
        request: &HttpRequest,
    ) -> Result<Vec<u8>, FetchError> {
        let _slot = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let span = info_span!(
            "http_fetch",
            %run_id,
            source_id,
            method = ?request.method,
            url = %request.url
        );
        self.attempt(request).instrument(span).await
    }

    async fn attempt(&self, request: &HttpRequest) -> Result<Vec<u8>, FetchError> {
        let retries = self.backoff.retries_for(request.method);
        let mut retry = 0usize;
        loop {
            let failure = match self.build(request).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.bytes().await?.to_vec());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (is_transient_status(status), err)
                }
                Err(err) => (is_transient_error(&err), FetchError::Request(err)),
            };
            match failure {
                (true, err) if retry < retries => {
                    debug!(error = %err, retry, "transient failure; retrying");
                    tokio::time::sleep(self.backoff.delay_before(retry)).await;
                    retry += 1;
                }
                (_, err) => return Err(err),
            }
        }
    }
}
