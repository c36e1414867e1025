//! Retry and back-off policy.
//!
//! Two independent policies live here:
//!
//! * [`RetryConfig`]: exponential back-off with jitter for transient failures
//!   (5xx, network errors).
//! * [`RetryAfterPolicy`]: how long to wait after a 429, honoring the provider's
//!   `Retry-After` hint.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};

/// Exponential back-off configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds. Doubles per attempt.
    #[serde(with = "crate::serde_millis")]
    pub base_delay: Duration,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub max_delay: Duration,
    /// Stretch each delay by a random factor in `[1, 2)`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// No delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts)
            .with_base_delay(Duration::ZERO)
            .with_jitter(false)
    }

    /// Delay after the given zero-based failed attempt:
    /// `min(base * 2^attempt * (1 + rand), max_delay)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let exponential = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        let delay = if self.jitter {
            exponential.mul_f64(1.0 + fastrand::f64())
        } else {
            exponential
        };
        delay.min(self.max_delay)
    }
}

/// Wait policy after an HTTP 429.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryAfterPolicy {
    /// Used when the provider sends no `Retry-After`, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub default_wait: Duration,
    pub min_jitter_factor: f64,
    pub max_jitter_factor: f64,
    /// Hard cap on a single 429 wait, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub max_wait: Duration,
    /// Waits longer than this also count as a breaker failure, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub breaker_threshold: Duration,
}

impl Default for RetryAfterPolicy {
    fn default() -> Self {
        Self {
            default_wait: Duration::from_secs(60),
            min_jitter_factor: 0.8,
            max_jitter_factor: 1.2,
            max_wait: Duration::from_secs(300),
            breaker_threshold: Duration::from_secs(60),
        }
    }
}

impl RetryAfterPolicy {
    pub fn delay_for(&self, retry_after: Option<Duration>) -> Duration {
        let base = retry_after.unwrap_or(self.default_wait);
        let spread = (self.max_jitter_factor - self.min_jitter_factor).max(0.0);
        let factor = self.min_jitter_factor + fastrand::f64() * spread;
        base.mul_f64(factor.max(0.0)).min(self.max_wait)
    }

    /// Whether a wait this long should also be reported to the circuit breaker.
    pub fn trips_breaker(&self, delay: Duration) -> bool {
        delay > self.breaker_threshold
    }
}

/// Result of a retried operation.
#[derive(Debug)]
pub struct RetryResult<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
    pub total_duration: Duration,
}

impl<T, E> RetryResult<T, E> {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Run an async operation until it succeeds, the error is not retryable, or the
/// attempts run out. The closure receives the zero-based attempt number.
pub async fn execute_with_retry_async<T, E, F, Fut, R>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: R,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let start = Instant::now();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                return RetryResult {
                    result: Ok(value),
                    attempts: attempt + 1,
                    total_duration: start.elapsed(),
                };
            }
            Err(err) => {
                let last = attempt + 1 >= max_attempts;
                if last || !should_retry(&err) {
                    return RetryResult {
                        result: Err(err),
                        attempts: attempt + 1,
                        total_duration: start.elapsed(),
                    };
                }
                let delay = config.backoff_delay(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
