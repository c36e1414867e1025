//! Catalog enrichment: checkpointed, resumable tagging of a catalog backlog against
//! a quota-limited metadata API.
//!
//! The workspace splits the concerns the way a run uses them:
//!
//! - `resilience`: adaptive rate limiter, circuit breaker, retry policy
//! - `store`: work items, sinks, checkpoints, atomic JSON snapshots
//! - `upstream`: transports, caches and the [`ResilientClient`]
//!
//! This crate wires them into a per-item [`pipeline`] and the
//! [`CheckpointedBatchProcessor`], and adds shard planning, status and cache
//! prewarming for the binary.
//!
//! ```no_run
//! use enrich::{CheckpointedBatchProcessor, EnrichConfig, EnrichContext, ShardSpec};
//! use std::sync::Arc;
//! use enrich::store::CheckpointStore;
//! use enrich::upstream::FixtureTransport;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EnrichConfig::load(None)?;
//! let transport = Arc::new(FixtureTransport::from_path("catalog.json".as_ref())?);
//! let ctx = EnrichContext::from_config(&config, 0, transport).await?;
//! ctx.client.probe().await?;
//!
//! let shard = ShardSpec::new(0, 1, 10_000)?;
//! let summary = CheckpointedBatchProcessor::new(
//!     ctx,
//!     config.batch.clone(),
//!     shard,
//!     CheckpointStore::for_shard(&config.state_dir, 0),
//! )
//! .run()
//! .await?;
//! println!("{:?} at boundary {}", summary.state, summary.boundary_id);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod plan;
pub mod prewarm;
pub mod processor;
pub mod shutdown;
pub mod status;

pub use config::{BatchConfig, ConfigLoadError, EnrichConfig};
pub use context::EnrichContext;
pub use error::EnrichError;
pub use pipeline::{process_item, search_query, FailureReason, ItemOutcome};
pub use plan::{plan_shards, ShardPlan};
pub use prewarm::prewarm_caches;
pub use processor::{CheckpointedBatchProcessor, RunState, RunSummary, ShardSpec};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use status::{shard_status, ShardStatus};

pub use resilience;
pub use store;
pub use upstream;
pub use upstream::ResilientClient;
