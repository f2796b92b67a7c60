//! Rate-limited HTTP fetching with bounded retries.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

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
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bursts of up to `requests`, refilled evenly over one second. `None` for zero.
    pub fn per_second(requests: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            capacity: requests,
            refill_every: Duration::from_secs(1) / requests,
        })
    }
}

/// Request pacing. One bucket may be shared by every source or dedicated to one source.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> TokenBucketConfig {
        TokenBucketConfig {
            capacity: self.capacity,
            refill_every: self.refill_every,
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<JsonValue, FetchError> {
        serde_json::from_slice(&self.body).map_err(|err| FetchError::Decode {
            url: self.final_url.clone(),
            message: err.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request { source, .. } => {
                classify_reqwest_error(source) == RetryDisposition::Retryable
            }
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            Self::Decode { .. } => false,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<SimpleTokenBucket>,
    source_buckets: HashMap<String, SimpleTokenBucket>,
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

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| SimpleTokenBucket::new(c.capacity, c.refill_every));

        Ok(Self {
            client,
            token_bucket,
            source_buckets: HashMap::new(),
            backoff: config.backoff,
        })
    }

    /// Paces `source_name` with its own bucket instead of the shared one.
    pub fn with_source_rate_limit(
        mut self,
        source_name: impl Into<String>,
        limit: TokenBucketConfig,
    ) -> Self {
        self.source_buckets.insert(
            source_name.into(),
            SimpleTokenBucket::new(limit.capacity, limit.refill_every),
        );
        self
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// The pacing applied to requests for `source_name`, if any.
    pub fn rate_limit_for(&self, source_name: &str) -> Option<TokenBucketConfig> {
        self.bucket_for(source_name).map(SimpleTokenBucket::config)
    }

    fn bucket_for(&self, source_name: &str) -> Option<&SimpleTokenBucket> {
        self.source_buckets
            .get(source_name)
            .or(self.token_bucket.as_ref())
    }

    pub async fn get(
        &self,
        source_name: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry(source_name, url, || self.client.get(url).query(query))
            .await
    }

    pub async fn post_json(
        &self,
        source_name: &str,
        url: &str,
        body: &JsonValue,
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry(source_name, url, || self.client.post(url).json(body))
            .await
    }

    /// Sends the request built by `build`, retrying retryable failures with capped
    /// exponential backoff. `build` is called once per attempt.
    async fn send_with_retry<F>(
        &self,
        source_name: &str,
        url: &str,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let span = info_span!("http_fetch", source = source_name, url);
        async {
            let max_attempts = self.backoff.max_retries + 1;
            let mut attempt = 0usize;
            loop {
                if let Some(bucket) = self.bucket_for(source_name) {
                    bucket.take().await;
                }
                attempt += 1;

                let error = match build().send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();
                        if status.is_success() {
                            let body = resp.bytes().await.map_err(|source| FetchError::Request {
                                url: final_url.clone(),
                                attempts: attempt,
                                source,
                            })?;
                            debug!(attempt, bytes = body.len(), "fetched");
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body: body.to_vec(),
                            });
                        }
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        }
                    }
                    Err(source) => FetchError::Request {
                        url: url.to_string(),
                        attempts: attempt,
                        source,
                    },
                };

                if error.is_retryable() && attempt < max_attempts {
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    warn!(attempt, ?delay, error = %error, "retrying request");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(error);
            }
        }
        .instrument(span)
        .await
    }
}
