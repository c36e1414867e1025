//! Resilience primitives for talking to a quota-limited upstream.
//!
//! - [`AdaptiveRateLimiter`]: sliding-window limiter that tunes itself from quota hints
//! - [`CircuitBreaker`]: three-state breaker that fails fast while the upstream is down
//! - [`RetryConfig`] / [`RetryAfterPolicy`]: back-off for transient errors and 429s
//!
//! All primitives are safe to share across tasks behind an `Arc` and use the tokio
//! clock, so tests can drive them with a paused runtime.

mod circuit_breaker;
mod rate_limit;
mod retry;
pub mod serde_millis;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use rate_limit::{AdaptiveRateLimiter, QuotaInfo, RateLimitConfig, RateLimitStats};
pub use retry::{execute_with_retry_async, RetryAfterPolicy, RetryConfig, RetryResult};
