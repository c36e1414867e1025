use crate::config::EnrichConfig;
use crate::error::EnrichError;
use crate::processor::ShardSpec;
use resilience::{AdaptiveRateLimiter, CircuitBreaker};
use std::sync::Arc;
use store::{RangeProgress, Sink, SinkConfig};
use upstream::{ProcessingStats, ResilientClient, Transport};

/// Everything a run needs, passed explicitly into the processor.
#[derive(Clone)]
pub struct EnrichContext {
    pub client: Arc<ResilientClient>,
    pub sink: Arc<dyn Sink>,
    pub stats: Arc<ProcessingStats>,
}

impl EnrichContext {
    pub fn new(client: Arc<ResilientClient>, sink: Arc<dyn Sink>) -> Self {
        let stats = Arc::clone(client.stats());
        Self {
            client,
            sink,
            stats,
        }
    }

    /// Wire a shard's client (limiter, breaker, persistent caches) and sink from config.
    pub async fn from_config(
        config: &EnrichConfig,
        process_id: u32,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, EnrichError> {
        std::fs::create_dir_all(&config.state_dir).map_err(store::StoreError::from)?;

        let client = ResilientClient::new(transport, config.client.clone())
            .with_limiter(Arc::new(AdaptiveRateLimiter::new(config.rate_limit)))
            .with_breaker(Arc::new(CircuitBreaker::new(
                format!("upstream-{process_id}"),
                config.circuit_breaker,
            )))
            .with_persistent_caches(&config.state_dir, process_id)?;

        let sink = config.sink.build().await?;
        tracing::info!(
            process_id,
            sink = config.sink.backend_name(),
            cached_hits = client.cache_len(),
            cached_failures = client.failure_cache_len(),
            "context ready"
        );
        Ok(Self::new(Arc::new(client), sink))
    }

    /// Startup check of the sink against a shard: warns when the backend cannot be
    /// shared with other shard processes or when the range holds no work items.
    pub async fn check_sink(
        &self,
        sink_config: &SinkConfig,
        shard: &ShardSpec,
    ) -> Result<RangeProgress, EnrichError> {
        if !sink_config.is_shared() {
            tracing::warn!(
                sink = sink_config.backend_name(),
                "sink is local to this process; run concurrent shards against postgres only"
            );
        }
        let progress = self.sink.progress(shard.min_id..=shard.max_id).await?;
        if progress.total == 0 {
            match sink_config {
                SinkConfig::Memory => tracing::warn!(
                    "memory sink holds no items for this range; import items or configure a persistent sink"
                ),
                _ => tracing::warn!(
                    min_id = shard.min_id,
                    max_id = shard.max_id,
                    "sink holds no work items in this range"
                ),
            }
        } else {
            tracing::info!(
                total = progress.total,
                classified = progress.classified,
                "sink progress for shard"
            );
        }
        Ok(progress)
    }
}
