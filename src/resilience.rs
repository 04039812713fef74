//! Retry with exponential backoff.
//!
//! Used by recovery phases and by the master when republishing a committed
//! state. Only errors classified as retryable by
//! [`MeridianError::is_retryable`] are retried.

use crate::error::{MeridianError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Add up to 25% random jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Retry configuration derived from the recovery settings.
    pub fn for_recovery(config: &crate::config::RecoveryConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            initial_delay: config.retry_backoff,
            max_delay: config.max_retry_backoff,
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Fixed delay, no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Calculate delay after a failed `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::from_secs_f64(base_delay.min(self.max_delay.as_secs_f64()));

        if self.jitter {
            let jitter_factor = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
            Duration::from_secs_f64(delay.as_secs_f64() * jitter_factor)
        } else {
            delay
        }
    }
}

/// Retry executor with exponential backoff.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute a function with retries.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_observed(f, |_, _| {}).await
    }

    /// Execute with retries, calling `on_failure(attempt, &error)` after
    /// every failed attempt, the last one included.
    pub async fn execute_observed<F, Fut, T, O>(&self, f: F, on_failure: O) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        O: FnMut(u32, &MeridianError),
    {
        self.execute_when(f, MeridianError::is_retryable, on_failure).await
    }

    /// Like [`execute_observed`](Self::execute_observed), with `retry_if`
    /// deciding which errors are worth another attempt.
    pub async fn execute_when<F, Fut, T, P, O>(&self, mut f: F, retry_if: P, mut on_failure: O) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&MeridianError) -> bool,
        O: FnMut(u32, &MeridianError),
    {
        let mut attempt = 0;
        let mut last_error = None;

        while attempt < self.config.max_attempts {
            attempt += 1;

            match f().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    on_failure(attempt, &e);
                    if !retry_if(&e) {
                        return Err(e);
                    }

                    last_error = Some(e);

                    if attempt < self.config.max_attempts {
                        let delay = self.config.delay_for_attempt(attempt);
                        tracing::debug!(
                            attempt = attempt,
                            max_attempts = self.config.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying after failure"
                        );
                        sleep(delay).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            MeridianError::Internal("Retry exhausted without error".to_string())
        }))
    }
}
