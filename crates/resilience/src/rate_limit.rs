//! Adaptive rate limiting for quota-limited upstreams.
//!
//! The limiter keeps a sliding window of call slots. Callers ask
//! [`AdaptiveRateLimiter::should_wait`] before every network call; the call is
//! recorded immediately (call-then-wait accounting) and the returned duration is how
//! long the caller must sleep before issuing it. Because the slot is reserved up
//! front, concurrent callers are serialized behind each other instead of all
//! observing the same free window.
//!
//! The target rate adapts to provider quota hints: a nearly exhausted quota halves
//! it, an ample quota grows it slowly, and an explicit 429 halves it as well.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for the adaptive limiter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Starting target rate. Kept conservative, the limiter speeds up on its own.
    pub initial_rate_per_minute: f64,
    /// Floor for the target rate after repeated slow-downs.
    pub min_rate_per_minute: f64,
    /// Ceiling for the target rate. Per process; N shards may reach N times this.
    pub max_rate_per_minute: f64,
    /// Remaining quota below which the target rate is cut.
    pub low_quota_threshold: u64,
    /// Remaining quota above which the target rate may grow.
    pub high_quota_threshold: u64,
    /// Multiplier applied on low quota or 429.
    pub decrease_factor: f64,
    /// Multiplier applied on ample quota.
    pub increase_factor: f64,
    /// Length of the sliding window in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub window: Duration,
    /// Upper bound of the random delay added to every throttled slot, in milliseconds.
    #[serde(with = "crate::serde_millis")]
    pub max_jitter: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            initial_rate_per_minute: 80.0,
            min_rate_per_minute: 20.0,
            max_rate_per_minute: 90.0,
            low_quota_threshold: 10,
            high_quota_threshold: 50,
            decrease_factor: 0.5,
            increase_factor: 1.1,
            window: Duration::from_secs(60),
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl RateLimitConfig {
    pub fn with_initial_rate(mut self, per_minute: f64) -> Self {
        self.initial_rate_per_minute = per_minute;
        self
    }

    pub fn with_rate_bounds(mut self, min_per_minute: f64, max_per_minute: f64) -> Self {
        self.min_rate_per_minute = min_per_minute;
        self.max_rate_per_minute = max_per_minute;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    fn clamp(&self, rate: f64) -> f64 {
        rate.max(self.min_rate_per_minute)
            .min(self.max_rate_per_minute)
            .max(1.0)
    }
}

/// Quota hints reported by the provider alongside a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaInfo {
    /// Calls left in the provider's current window.
    pub remaining: Option<u64>,
    /// Size of the provider's window.
    pub limit: Option<u64>,
    /// Unix timestamp (seconds) at which the provider window resets.
    pub reset_epoch_secs: Option<u64>,
}

impl QuotaInfo {
    pub fn is_empty(&self) -> bool {
        self.remaining.is_none() && self.limit.is_none() && self.reset_epoch_secs.is_none()
    }
}

#[derive(Debug)]
struct LimiterState {
    target_rate_per_minute: f64,
    /// Reserved call slots, sorted. Slots may lie in the future.
    slots: VecDeque<Instant>,
    last_slot: Option<Instant>,
    quota: QuotaInfo,
}

/// Self-tuning sliding-window rate limiter.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
    total_calls: AtomicU64,
    total_throttled: AtomicU64,
}

impl AdaptiveRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState {
                target_rate_per_minute: config.clamp(config.initial_rate_per_minute),
                slots: VecDeque::new(),
                last_slot: None,
                quota: QuotaInfo::default(),
            }),
            total_calls: AtomicU64::new(0),
            total_throttled: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a call and return how long the caller must wait before issuing it.
    ///
    /// Below the target rate the answer is zero. At or above it the call is placed
    /// `window / target` (plus jitter) after the previous slot, and never before the
    /// oldest slot that still counts against the window has aged out, so no rolling
    /// window ever holds more than `target` calls.
    pub fn should_wait(&self) -> Duration {
        let mut state = self.lock();
        let now = Instant::now();
        let window = self.config.window;
        state
            .slots
            .retain(|slot| now.saturating_duration_since(*slot) < window);
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let capacity = state.target_rate_per_minute.floor().max(1.0) as usize;
        if state.slots.len() < capacity {
            let idx = state.slots.partition_point(|slot| *slot <= now);
            state.slots.insert(idx, now);
            state.last_slot = Some(state.last_slot.map_or(now, |last| last.max(now)));
            return Duration::ZERO;
        }

        let spacing = Duration::from_secs_f64(window.as_secs_f64() / state.target_rate_per_minute);
        let paced = state.last_slot.map_or(now, |last| last.max(now)) + spacing + self.jitter();
        let freed = state.slots[state.slots.len() - capacity] + window;
        let slot = paced.max(freed);

        state.slots.push_back(slot);
        state.last_slot = Some(slot);
        self.total_throttled.fetch_add(1, Ordering::Relaxed);
        slot.saturating_duration_since(now)
    }

    /// Feed provider quota headers into the limiter.
    pub fn observe_quota(&self, quota: &QuotaInfo) {
        if quota.is_empty() {
            return;
        }
        let mut state = self.lock();
        if quota.remaining.is_some() {
            state.quota.remaining = quota.remaining;
        }
        if quota.limit.is_some() {
            state.quota.limit = quota.limit;
        }
        if quota.reset_epoch_secs.is_some() {
            state.quota.reset_epoch_secs = quota.reset_epoch_secs;
        }

        let Some(remaining) = quota.remaining else {
            return;
        };
        let before = state.target_rate_per_minute;
        if remaining < self.config.low_quota_threshold {
            state.target_rate_per_minute = self.config.clamp(before * self.config.decrease_factor);
            tracing::warn!(
                remaining,
                from = before,
                to = state.target_rate_per_minute,
                "upstream quota nearly exhausted, slowing down"
            );
        } else if remaining > self.config.high_quota_threshold {
            state.target_rate_per_minute = self.config.clamp(before * self.config.increase_factor);
            if state.target_rate_per_minute > before {
                tracing::debug!(
                    remaining,
                    to = state.target_rate_per_minute,
                    "ample upstream quota, speeding up"
                );
            }
        }
    }

    /// The upstream answered 429: cut the target rate.
    pub fn on_rate_limited(&self) {
        let mut state = self.lock();
        let before = state.target_rate_per_minute;
        state.target_rate_per_minute = self.config.clamp(before * self.config.decrease_factor);
        tracing::warn!(
            from = before,
            to = state.target_rate_per_minute,
            "rate limited by upstream, lowering target rate"
        );
    }

    pub fn target_rate(&self) -> f64 {
        self.lock().target_rate_per_minute
    }

    /// Get current statistics.
    pub fn stats(&self) -> RateLimitStats {
        let state = self.lock();
        let now = Instant::now();
        let calls_in_window = state
            .slots
            .iter()
            .filter(|slot| now.saturating_duration_since(**slot) < self.config.window)
            .count();
        RateLimitStats {
            target_rate_per_minute: state.target_rate_per_minute,
            calls_in_window,
            remaining_quota: state.quota.remaining,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_throttled: self.total_throttled.load(Ordering::Relaxed),
        }
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.config.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=max_ms))
        }
    }
}

impl Default for AdaptiveRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// Statistics for the limiter.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitStats {
    pub target_rate_per_minute: f64,
    pub calls_in_window: usize,
    pub remaining_quota: Option<u64>,
    pub total_calls: u64,
    pub total_throttled: u64,
}

impl RateLimitStats {
    /// Fraction of calls that had to wait (0.0 to 1.0).
    pub fn wait_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_throttled as f64 / self.total_calls as f64
        }
    }
}
