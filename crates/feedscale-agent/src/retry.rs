//! Retry logic with exponential backoff for lease store and change feed calls.
//!
//! Only transient failures are retried. Configuration errors and data errors come
//! back on the first attempt, as do lost conditional writes (those are outcomes,
//! not errors).
//!
//! ```text
//! backoff = min(initial_backoff * multiplier^attempt, max_backoff)
//!
//! With defaults (100ms initial, 2x multiplier, 30s max):
//! - Attempt 1: 100ms
//! - Attempt 2: 200ms
//! - Attempt 3: 400ms
//! - Attempt 4: 800ms
//! - Attempt 5: 1.6s
//! ```

use crate::error::AgentError;
use feedscale_core::FeedError;
use feedscale_metadata::MetadataError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Errors that know whether a retry may help.
pub trait RetryableError: Display {
    fn is_transient(&self) -> bool;
}

impl RetryableError for MetadataError {
    fn is_transient(&self) -> bool {
        MetadataError::is_transient(self)
    }
}

impl RetryableError for FeedError {
    fn is_transient(&self) -> bool {
        FeedError::is_transient(self)
    }
}

impl RetryableError for AgentError {
    fn is_transient(&self) -> bool {
        AgentError::is_transient(self)
    }
}

/// Retry policy configuration for exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// A policy that gives up on the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        backoff.min(self.max_backoff)
    }
}

/// Run `operation`, retrying transient failures according to `policy`.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if !e.is_transient() {
                    return Err(e);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %e,
                        "Max retries exhausted, giving up"
                    );
                    return Err(e);
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Transient error, backing off"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
