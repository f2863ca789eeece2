//! Retry decorator for any [`KvClient`].
//!
//! Modeled on the `Retry` trait used elsewhere in this codebase for I/O retry policies:
//! `reset()` on success so a dynamic backoff returns to its minimum, `next_backoff(&error)`
//! per failure to decide whether and how long to wait. `ConditionalCheckFailed` and
//! `Terminal` are never retried; they're returned to the caller immediately.

pub use exponential_backoff::Backoff;
use std::fmt::Debug;
use std::time::Duration;

use super::{Condition, DocumentKey, KvClient, UpdateRequest};
use crate::error::KvError;
use crate::model::StreamState;
use async_trait::async_trait;

/// Determines which errors to retry and how long to wait before doing so.
pub trait Retry: Debug + Clone + Send + Sync {
    /// Called whenever an operation succeeds, so dynamic backoffs reset to their minimum.
    fn reset(&mut self);

    /// Returns `None` to give up and surface the transient error as-is; `Some(duration)`
    /// to wait and retry.
    fn next_backoff(&mut self, attempt: u32) -> Option<Duration>;
}

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    backoff: Backoff,
}

impl ExponentialBackoff {
    pub fn new(max_retries: impl Into<Option<u32>>) -> ExponentialBackoff {
        ExponentialBackoff {
            backoff: Backoff::new(
                max_retries.into().unwrap_or(u32::MAX),
                Duration::from_millis(100),
                Some(Duration::from_secs(30)),
            ),
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff::new(None)
    }
}

impl Retry for ExponentialBackoff {
    fn reset(&mut self) {
        // `exponential_backoff::Backoff` is stateless across calls (it's seeded by the
        // attempt count we pass in), so there's nothing to reset.
    }

    fn next_backoff(&mut self, attempt: u32) -> Option<Duration> {
        self.backoff.next(attempt)
    }
}

/// Wraps any [`KvClient`], retrying [`KvError::Transient`] with capped exponential
/// backoff. `ConditionalCheckFailed` and `Terminal` pass through untouched on the first
/// attempt, exactly as the wrapped client returned them.
pub struct RetryingKvClient<C, R> {
    inner: C,
    retry: tokio::sync::Mutex<R>,
}

impl<C, R: Retry> RetryingKvClient<C, R> {
    pub fn new(inner: C, retry: R) -> RetryingKvClient<C, R> {
        RetryingKvClient {
            inner,
            retry: tokio::sync::Mutex::new(retry),
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, KvError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, KvError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    self.retry.lock().await.reset();
                    return Ok(value);
                }
                Err(KvError::Transient(err)) => {
                    attempt += 1;
                    let backoff = self.retry.lock().await.next_backoff(attempt);
                    match backoff {
                        Some(wait) => {
                            tracing::debug!(attempt, ?wait, %err, "retrying transient key/value store error");
                            tokio::time::sleep(wait).await;
                        }
                        None => return Err(KvError::Transient(err)),
                    }
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[async_trait]
impl<C: KvClient, R: Retry> KvClient for RetryingKvClient<C, R> {
    async fn get(&self, key: &DocumentKey) -> Result<Option<StreamState>, KvError> {
        self.with_retry(|| self.inner.get(key)).await
    }

    async fn put(
        &self,
        key: &DocumentKey,
        item: &StreamState,
        condition: Option<Condition>,
    ) -> Result<(), KvError> {
        self.with_retry(|| self.inner.put(key, item, condition.clone()))
            .await
    }

    async fn update(&self, key: &DocumentKey, request: UpdateRequest) -> Result<(), KvError> {
        self.with_retry(|| self.inner.update(key, request.clone()))
            .await
    }

    async fn delete(&self, key: &DocumentKey) -> Result<(), KvError> {
        self.with_retry(|| self.inner.delete(key)).await
    }
}
