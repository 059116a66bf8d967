//! HTTP client for the remote booking feed: JSON POSTs with capped
//! exponential backoff on transient failures.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderValue, COOKIE};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid json: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Raw response body alongside its decoded JSON, so callers can archive
/// exactly what the server sent.
#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub body: Vec<u8>,
    pub json: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
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
        let client = builder.build().context("building http client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn post_json(
        &self,
        feed_id: &str,
        url: &str,
        body: &serde_json::Value,
        cookie: Option<&str>,
    ) -> Result<JsonResponse, FetchError> {
        let span = info_span!("http_post", feed_id, url);
        self.post_with_retries(url, body, cookie).instrument(span).await
    }

    async fn post_with_retries(
        &self,
        url: &str,
        body: &serde_json::Value,
        cookie: Option<&str>,
    ) -> Result<JsonResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.post(url).json(body);
            if let Some(value) = cookie.and_then(|c| HeaderValue::from_str(c).ok()) {
                request = request.header(COOKIE, value);
            }

            let failure = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let bytes = resp.bytes().await?.to_vec();
                    let json = serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                        url: url.to_string(),
                        source,
                    })?;
                    return Ok(JsonResponse { body: bytes, json });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (classify_status(status), err)
                }
                Err(err) => (classify_reqwest_error(&err), FetchError::Request(err)),
            };

            let (disposition, err) = failure;
            if disposition == RetryDisposition::NonRetryable
                || attempt >= self.backoff.max_retries
            {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying feed request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
