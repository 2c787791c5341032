//! Retry logic with exponential backoff
//!
//! Broker connection, queue declaration and message stream set-up are retried
//! a bounded number of times before the failure is surfaced to the operator.

use backoff::{backoff::Backoff, ExponentialBackoff};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::SubscriberError;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000, // 1 second
            max_delay_ms: 30000,    // 30 seconds
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            exponential_base: 2.0,
            jitter: true,
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub(crate) fn to_exponential_backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_delay_ms),
            max_interval: Duration::from_millis(self.max_delay_ms),
            multiplier: self.exponential_base,
            max_elapsed_time: None,
            ..Default::default()
        };

        if !self.jitter {
            backoff.randomization_factor = 0.0;
        }
        backoff.reset();

        backoff
    }
}

/// Retry an async operation with exponential backoff while its error is
/// retryable
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, SubscriberError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SubscriberError>>,
{
    if config.max_attempts <= 1 {
        debug!("No retry configured, executing operation once");
        return operation().await;
    }

    let mut backoff = config.to_exponential_backoff();
    let mut attempt = 1;

    loop {
        debug!(attempt, max_attempts = config.max_attempts, "Retry attempt");

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!("Operation succeeded after {} attempts", attempt);
                }
                return Ok(result);
            }
            Err(error) => {
                if attempt >= config.max_attempts || !error.is_retryable() {
                    warn!("Operation failed after {} attempts: {}", attempt, error);
                    return Err(error);
                }

                let Some(delay) = backoff.next_backoff() else {
                    warn!("Backoff exhausted after {} attempts", attempt);
                    return Err(error);
                };

                warn!(
                    "Operation failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt, config.max_attempts, delay, error
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
