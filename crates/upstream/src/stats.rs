use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for observability. Never consulted for correctness.
#[derive(Debug, Default)]
pub struct ProcessingStats {
    api_calls: AtomicU64,
    cache_hits: AtomicU64,
    negative_hits: AtomicU64,
    successes: AtomicU64,
    not_found: AtomicU64,
    failures: AtomicU64,
    items_completed: AtomicU64,
    items_failed: AtomicU64,
    items_skipped: AtomicU64,
}

impl ProcessingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_api_call(&self) {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negative_hit(&self) {
        self.negative_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// A call that answered but had nothing for the key: a 404 or an empty search.
    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_item_completed(&self) {
        self.items_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_item_failed(&self) {
        self.items_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_items_skipped(&self, count: u64) {
        self.items_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            api_calls: self.api_calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            items_completed: self.items_completed.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            items_skipped: self.items_skipped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub api_calls: u64,
    pub cache_hits: u64,
    pub negative_hits: u64,
    pub successes: u64,
    pub not_found: u64,
    pub failures: u64,
    pub items_completed: u64,
    pub items_failed: u64,
    pub items_skipped: u64,
}

impl StatsSnapshot {
    pub fn items_finished(&self) -> u64 {
        self.items_completed + self.items_failed
    }

    /// Completed share of finished items, 0.0 to 1.0.
    pub fn success_rate(&self) -> f64 {
        let finished = self.items_finished();
        if finished == 0 {
            0.0
        } else {
            self.items_completed as f64 / finished as f64
        }
    }

    /// Share of lookups answered from either cache.
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.api_calls + self.cache_hits + self.negative_hits;
        if lookups == 0 {
            0.0
        } else {
            (self.cache_hits + self.negative_hits) as f64 / lookups as f64
        }
    }
}
