//! Downstream cache invalidation. Always best effort: callers log failures and move on.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_CACHE_PREFIX: &str = "jobs:";

#[derive(Debug, Error)]
pub enum InvalidationError {
    #[error("cache invalidation request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("cache invalidation rejected with status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait Invalidator: Send + Sync {
    /// Drops every cached entry whose key starts with `prefix`.
    async fn invalidate(&self, prefix: &str) -> Result<(), InvalidationError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInvalidator;

#[async_trait]
impl Invalidator for NoopInvalidator {
    async fn invalidate(&self, prefix: &str) -> Result<(), InvalidationError> {
        debug!(prefix, "no cache configured; skipping invalidation");
        Ok(())
    }
}

/// Posts `{"prefix": ...}` to a cache service endpoint.
#[derive(Debug, Clone)]
pub struct HttpInvalidator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpInvalidator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, InvalidationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Invalidator for HttpInvalidator {
    async fn invalidate(&self, prefix: &str) -> Result<(), InvalidationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "prefix": prefix }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(InvalidationError::Rejected(status.as_u16()));
        }
        debug!(prefix, endpoint = %self.endpoint, "cache invalidated");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every prefix it is asked to drop; optionally fails each call.
    #[derive(Debug, Default)]
    pub struct RecordingInvalidator {
        pub calls: Mutex<Vec<String>>,
        pub fail: bool,
    }

    impl RecordingInvalidator {
        pub fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Invalidator for RecordingInvalidator {
        async fn invalidate(&self, prefix: &str) -> Result<(), InvalidationError> {
            self.calls.lock().unwrap().push(prefix.to_string());
            if self.fail {
                Err(InvalidationError::Rejected(503))
            } else {
                Ok(())
            }
        }
    }
}
