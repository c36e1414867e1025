//! Resilient client: caches, rate limiter, circuit breaker and retry policy
//! composed around a [`Transport`].
//!
//! Per call:
//!
//! 1. hit cache → cached value, no limiter or breaker involvement
//! 2. failure cache → [`ApiError::NotFound`]
//! 3. open breaker → [`ApiError::CircuitOpen`]
//! 4. up to `max_attempts` calls, each preceded by the limiter's wait
//! 5. attempts spent → key goes to the failure cache, [`ApiError::Transient`]

use crate::cache::{CacheKind, ResponseCache};
use crate::stats::ProcessingStats;
use crate::transport::{Operation, Outcome, Transport};
use crate::ApiError;
use resilience::{
    execute_with_retry_async, AdaptiveRateLimiter, CircuitBreaker, RetryAfterPolicy, RetryConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use store::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Back-off for searches.
    pub search_retry: RetryConfig,
    /// Back-off for entity fetches.
    pub entity_retry: RetryConfig,
    /// Wait policy after a 429.
    pub rate_limited: RetryAfterPolicy,
    /// Retry policy of the startup probe.
    pub probe_retry: RetryConfig,
    /// Query issued by the startup probe.
    pub probe_query: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            search_retry: RetryConfig::new(3),
            entity_retry: RetryConfig::new(5),
            rate_limited: RetryAfterPolicy::default(),
            probe_retry: RetryConfig::new(3),
            probe_query: "test".to_string(),
        }
    }
}

pub struct ResilientClient {
    transport: Arc<dyn Transport>,
    limiter: Arc<AdaptiveRateLimiter>,
    breaker: Arc<CircuitBreaker>,
    hits: Arc<ResponseCache>,
    failures: Arc<ResponseCache>,
    stats: Arc<ProcessingStats>,
    config: ClientConfig,
}

impl ResilientClient {
    /// A client with default limiter and breaker and in-memory caches.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            limiter: Arc::new(AdaptiveRateLimiter::default()),
            breaker: Arc::new(CircuitBreaker::new("upstream", Default::default())),
            hits: Arc::new(ResponseCache::in_memory()),
            failures: Arc::new(ResponseCache::in_memory()),
            stats: Arc::new(ProcessingStats::new()),
            config,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_caches(mut self, hits: Arc<ResponseCache>, failures: Arc<ResponseCache>) -> Self {
        self.hits = hits;
        self.failures = failures;
        self
    }

    pub fn with_stats(mut self, stats: Arc<ProcessingStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Load both per-shard cache files from `state_dir`.
    pub fn with_persistent_caches(self, state_dir: &Path, process_id: u32) -> Result<Self, StoreError> {
        let hits = ResponseCache::load(CacheKind::Hit.path(state_dir, process_id))?;
        let failures = ResponseCache::load(CacheKind::Failure.path(state_dir, process_id))?;
        Ok(self.with_caches(Arc::new(hits), Arc::new(failures)))
    }

    pub fn limiter(&self) -> &AdaptiveRateLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn stats(&self) -> &Arc<ProcessingStats> {
        &self.stats
    }

    /// Entries in the hit cache.
    pub fn cache_len(&self) -> usize {
        self.hits.len()
    }

    /// Entries in the failure cache.
    pub fn failure_cache_len(&self) -> usize {
        self.failures.len()
    }

    /// Related entity ids of the best match for `query`. No match is `NotFound`.
    pub async fn search(&self, query: &str) -> Result<BTreeSet<String>, ApiError> {
        self.call(Operation::Search { query }).await
    }

    /// Attribute tags of entity `id`.
    pub async fn fetch_entity(&self, id: &str) -> Result<BTreeSet<String>, ApiError> {
        self.call(Operation::FetchEntity { id }).await
    }

    /// Check reachability and credentials before any batch work. A miss counts as
    /// reachable; only auth failures and exhausted retries are errors.
    pub async fn probe(&self) -> Result<(), ApiError> {
        let this = self;
        let query = self.config.probe_query.as_str();
        let result = execute_with_retry_async(
            &self.config.probe_retry,
            move |_| async move {
                let wait = this.limiter.should_wait();
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                this.stats.record_api_call();
                let reply = this.transport.execute(&Operation::Search { query }).await;
                this.limiter.observe_quota(&reply.quota);
                reply.outcome.into_result()
            },
            ApiError::is_retryable,
        )
        .await;

        match result.into_result() {
            Ok(_) | Err(ApiError::NotFound) => {
                tracing::info!("upstream probe succeeded");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "upstream probe failed");
                Err(err)
            }
        }
    }

    /// Persist both caches. Runs the file writes on the blocking pool.
    pub async fn flush_caches(&self) -> Result<(), StoreError> {
        let hits = Arc::clone(&self.hits);
        let failures = Arc::clone(&self.failures);
        let (hit_entries, failure_entries) = tokio::task::spawn_blocking(move || {
            Ok::<_, StoreError>((hits.flush()?, failures.flush()?))
        })
        .await
        .map_err(StoreError::backend)??;
        if hit_entries + failure_entries > 0 {
            tracing::info!(
                hit_entries = self.hits.len(),
                failure_entries = self.failures.len(),
                "caches saved"
            );
        }
        Ok(())
    }

    fn retry_for(&self, op: &Operation<'_>) -> &RetryConfig {
        match op {
            Operation::Search { .. } => &self.config.search_retry,
            Operation::FetchEntity { .. } => &self.config.entity_retry,
        }
    }

    async fn call(&self, op: Operation<'_>) -> Result<BTreeSet<String>, ApiError> {
        let key = op.cache_key();
        if let Some(value) = self.hits.get(&key) {
            self.stats.record_cache_hit();
            return Ok(value);
        }
        if self.failures.contains(&key) {
            self.stats.record_negative_hit();
            return Err(ApiError::NotFound);
        }
        if !self.breaker.can_execute() {
            return Err(ApiError::CircuitOpen);
        }

        let retry = *self.retry_for(&op);
        let max_attempts = retry.max_attempts.max(1);
        let mut last_status = None;

        for attempt in 0..max_attempts {
            let last = attempt + 1 == max_attempts;
            let wait = self.limiter.should_wait();
            if !wait.is_zero() {
                tracing::debug!(op = op.name(), wait_ms = wait.as_millis() as u64, "throttling");
                tokio::time::sleep(wait).await;
            }

            self.stats.record_api_call();
            let reply = self.transport.execute(&op).await;
            self.limiter.observe_quota(&reply.quota);

            match reply.outcome {
                Outcome::Ok(value) => {
                    self.breaker.record_success();
                    if value.is_empty() && matches!(op, Operation::Search { .. }) {
                        self.stats.record_not_found();
                        self.failures.insert(key, BTreeSet::new());
                        return Err(ApiError::NotFound);
                    }
                    self.stats.record_success();
                    self.hits.insert(key, value.clone());
                    return Ok(value);
                }
                Outcome::NotFound => {
                    self.stats.record_not_found();
                    self.failures.insert(key, BTreeSet::new());
                    return Err(ApiError::NotFound);
                }
                Outcome::Unauthorized { status } => {
                    return Err(ApiError::Auth { status });
                }
                Outcome::ClientError { status } => {
                    tracing::warn!(op = %op.label(), status, "request rejected by upstream");
                    self.failures.insert(key, BTreeSet::new());
                    self.stats.record_failure();
                    return Err(ApiError::Client { status });
                }
                Outcome::RateLimited { retry_after } => {
                    last_status = Some(429);
                    self.limiter.on_rate_limited();
                    let delay = self.config.rate_limited.delay_for(retry_after);
                    if self.config.rate_limited.trips_breaker(delay) {
                        self.breaker.record_failure();
                    }
                    tracing::warn!(
                        op = op.name(),
                        attempt = attempt + 1,
                        max_attempts,
                        delay_secs = delay.as_secs_f64(),
                        "rate limited"
                    );
                    if !last {
                        tokio::time::sleep(delay).await;
                    }
                }
                outcome @ (Outcome::ServerError { .. } | Outcome::Network(_)) => {
                    last_status = match &outcome {
                        Outcome::ServerError { status } => Some(*status),
                        _ => None,
                    };
                    if last {
                        self.breaker.record_failure();
                    } else {
                        let delay = retry.backoff_delay(attempt);
                        log_transient(&op, &outcome, attempt + 1, max_attempts, delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::warn!(op = %op.label(), attempts = max_attempts, status = ?last_status, "giving up");
        self.failures.insert(key, BTreeSet::new());
        self.stats.record_failure();
        Err(ApiError::Transient {
            status: last_status,
            attempts: max_attempts,
        })
    }
}

fn log_transient(op: &Operation<'_>, outcome: &Outcome, attempt: u32, max_attempts: u32, delay: Duration) {
    match outcome {
        Outcome::ServerError { status } => tracing::warn!(
            op = op.name(),
            status,
            attempt,
            max_attempts,
            delay_secs = delay.as_secs_f64(),
            "server error, backing off"
        ),
        other => tracing::warn!(
            op = op.name(),
            error = ?other,
            attempt,
            max_attempts,
            delay_secs = delay.as_secs_f64(),
            "network error, backing off"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{FixtureCatalog, FixtureTransport};
    use resilience::{CircuitBreakerConfig, CircuitState, QuotaInfo, RateLimitConfig};
    use tokio::time::Instant;

    fn catalog() -> FixtureCatalog {
        FixtureCatalog::default()
            .with_track("Bohemian Rhapsody", ["queen"])
            .with_entity("queen", ["rock", "glam rock"])
    }

    fn client(transport: Arc<FixtureTransport>) -> ResilientClient {
        ResilientClient::new(transport, ClientConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_then_success_waits_and_caches() {
        let transport = Arc::new(FixtureTransport::new(catalog()).script(
            "fetch_entity:queen",
            [Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            }],
        ));
        let client = client(Arc::clone(&transport));

        let started = Instant::now();
        let tags = client.fetch_entity("queen").await.unwrap();
        let waited = started.elapsed();
        assert_eq!(tags.len(), 2);
        assert!(waited >= Duration::from_secs(24), "waited {waited:?}");
        assert!(waited <= Duration::from_secs(37), "waited {waited:?}");
        assert_eq!(transport.calls("fetch_entity:queen"), 2);
        assert_eq!(client.limiter().target_rate(), 40.0);

        let again = client.fetch_entity("queen").await.unwrap();
        assert_eq!(again, tags);
        assert_eq!(transport.calls("fetch_entity:queen"), 2);
        assert_eq!(client.stats().snapshot().cache_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_remembered() {
        let transport = Arc::new(FixtureTransport::new(catalog()));
        let client = client(Arc::clone(&transport));

        for _ in 0..3 {
            assert!(matches!(client.fetch_entity("ghost").await, Err(ApiError::NotFound)));
        }
        assert_eq!(transport.calls("fetch_entity:ghost"), 1);
        assert_eq!(client.failure_cache_len(), 1);
        assert_eq!(client.stats().snapshot().negative_hits, 2);
        assert_eq!(client.stats().snapshot().not_found, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_search_is_not_found() {
        let transport = Arc::new(FixtureTransport::new(catalog()));
        let client = client(Arc::clone(&transport));

        assert!(matches!(client.search("Nothing Matches").await, Err(ApiError::NotFound)));
        assert!(matches!(client.search("Nothing Matches").await, Err(ApiError::NotFound)));
        assert_eq!(transport.calls("search:Nothing Matches"), 1);
        assert_eq!(client.cache_len(), 0);

        let stats = client.stats().snapshot();
        assert_eq!(stats.successes, 0);
        assert_eq!(stats.not_found, 1);
        assert_eq!(stats.negative_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_exhaust_into_transient() {
        let transport = Arc::new(
            FixtureTransport::new(catalog())
                .script("fetch_entity:queen", vec![Outcome::ServerError { status: 503 }; 5]),
        );
        let client = client(Arc::clone(&transport));

        let err = client.fetch_entity("queen").await.unwrap_err();
        assert!(matches!(err, ApiError::Transient { status: Some(503), attempts: 5 }));
        assert_eq!(transport.calls("fetch_entity:queen"), 5);
        assert_eq!(client.breaker().snapshot().failure_count, 1);

        // Exhausted keys short-circuit for the rest of the run.
        assert!(matches!(client.fetch_entity("queen").await, Err(ApiError::NotFound)));
        assert_eq!(transport.calls("fetch_entity:queen"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_recovers_within_attempts() {
        let transport = Arc::new(FixtureTransport::new(catalog()).script(
            "search:Bohemian Rhapsody",
            [Outcome::ServerError { status: 500 }, Outcome::Network("reset".into())],
        ));
        let client = client(Arc::clone(&transport));

        let ids = client.search("Bohemian Rhapsody").await.unwrap();
        assert_eq!(ids, BTreeSet::from(["queen".to_string()]));
        assert_eq!(transport.calls("search:Bohemian Rhapsody"), 3);
        assert_eq!(client.breaker().snapshot().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_breaker_fails_fast_without_network() {
        let transport = Arc::new(FixtureTransport::new(catalog()));
        let breaker = Arc::new(CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default().with_failure_threshold(1),
        ));
        breaker.record_failure();
        let client = client(Arc::clone(&transport)).with_breaker(Arc::clone(&breaker));

        assert!(matches!(client.fetch_entity("queen").await, Err(ApiError::CircuitOpen)));
        assert_eq!(transport.total_calls(), 0);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hits_bypass_open_breaker() {
        let transport = Arc::new(FixtureTransport::new(catalog()));
        let breaker = Arc::new(CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::default().with_failure_threshold(1),
        ));
        let client = client(Arc::clone(&transport)).with_breaker(Arc::clone(&breaker));
        client.fetch_entity("queen").await.unwrap();

        breaker.record_failure();
        assert!(client.fetch_entity("queen").await.is_ok());
        assert_eq!(transport.total_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_rate_limit_waits_feed_the_breaker() {
        let transport = Arc::new(FixtureTransport::new(catalog()).script(
            "fetch_entity:queen",
            [Outcome::RateLimited {
                retry_after: Some(Duration::from_secs(120)),
            }],
        ));
        let client = client(Arc::clone(&transport));

        assert!(client.fetch_entity("queen").await.is_ok());
        // One failure from the long wait, then one success decrements it again.
        assert_eq!(client.breaker().snapshot().failure_count, 0);
        assert_eq!(client.breaker().snapshot().trips, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_is_fatal_and_not_cached() {
        let transport = Arc::new(
            FixtureTransport::new(catalog()).with_fallback(Outcome::Unauthorized { status: 401 }),
        );
        let client = client(Arc::clone(&transport));

        let err = client.fetch_entity("queen").await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(client.failure_cache_len(), 0);
        assert_eq!(transport.total_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_terminal() {
        let transport = Arc::new(
            FixtureTransport::new(catalog())
                .script("fetch_entity:bad id", [Outcome::ClientError { status: 400 }]),
        );
        let client = client(Arc::clone(&transport));

        assert!(matches!(
            client.fetch_entity("bad id").await,
            Err(ApiError::Client { status: 400 })
        ));
        assert_eq!(transport.calls("fetch_entity:bad id"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_hints_reach_the_limiter() {
        let transport = Arc::new(FixtureTransport::new(catalog()).with_quota(QuotaInfo {
            remaining: Some(2),
            ..QuotaInfo::default()
        }));
        let limiter = Arc::new(AdaptiveRateLimiter::new(RateLimitConfig::default()));
        let client = client(Arc::clone(&transport)).with_limiter(Arc::clone(&limiter));

        client.fetch_entity("queen").await.unwrap();
        assert_eq!(limiter.target_rate(), 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_retries_then_succeeds() {
        let transport = Arc::new(FixtureTransport::new(catalog()).script(
            "search:test",
            [Outcome::ServerError { status: 502 }, Outcome::Network("timeout".into())],
        ));
        let client = client(Arc::clone(&transport));

        client.probe().await.unwrap();
        assert_eq!(transport.calls("search:test"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_reports_auth_failure_immediately() {
        let transport = Arc::new(
            FixtureTransport::new(catalog()).with_fallback(Outcome::Unauthorized { status: 401 }),
        );
        let client = client(Arc::clone(&transport));

        let err = client.probe().await.unwrap_err();
        assert!(matches!(err, ApiError::Auth { status: 401 }));
        assert_eq!(transport.total_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_caches_survive_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let transport = Arc::new(FixtureTransport::new(catalog()));
        {
            let client = client(Arc::clone(&transport))
                .with_persistent_caches(dir.path(), 4)
                .unwrap();
            client.fetch_entity("queen").await.unwrap();
            let _ = client.fetch_entity("ghost").await;
            client.flush_caches().await.unwrap();
        }

        let restarted = client(Arc::clone(&transport))
            .with_persistent_caches(dir.path(), 4)
            .unwrap();
        assert_eq!(restarted.cache_len(), 1);
        assert_eq!(restarted.failure_cache_len(), 1);
        restarted.fetch_entity("queen").await.unwrap();
        assert!(restarted.fetch_entity("ghost").await.is_err());
        assert_eq!(transport.total_calls(), 2);
    }
}
