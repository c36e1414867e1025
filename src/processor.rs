//! Checkpointed scan over a shard's static id range.
//!
//! ```text
//! resume ──> [fetch window] ──> [skip classified/settled] ──> [dispatch to workers]
//!                 ^                                                   │
//!                 │        advance boundary, save checkpoint <────────┘
//!                 └──────────────── inter-batch delay ────────────────┘
//! ```
//!
//! The boundary only moves once every item of a window is settled. Items rejected by
//! an open circuit are marked failed like any other upstream error; the pause before
//! the next window stretches to the breaker's remaining cooldown.
//! Checkpoint and caches are saved on every exit path, including fatal errors.

use crate::config::BatchConfig;
use crate::context::EnrichContext;
use crate::error::EnrichError;
use crate::pipeline::{process_item, FailureReason, ItemOutcome};
use crate::shutdown::ShutdownSignal;
use futures::{future, stream, StreamExt};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::time::Duration;
use store::{Checkpoint, CheckpointStore, WorkItem};
use tokio::time::Instant;
use upstream::{ApiError, StatsSnapshot};

/// The static id range assigned to one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    pub process_id: u32,
    pub min_id: i64,
    pub max_id: i64,
}

impl ShardSpec {
    pub fn new(process_id: u32, min_id: i64, max_id: i64) -> Result<Self, EnrichError> {
        if min_id > max_id {
            return Err(EnrichError::InvalidRange { min_id, max_id });
        }
        Ok(Self {
            process_id,
            min_id,
            max_id,
        })
    }

    /// Number of ids in the range, saturating at `u64::MAX` for the full `i64` span.
    pub fn id_count(&self) -> u64 {
        self.max_id.abs_diff(self.min_id).saturating_add(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Every id in the range was scanned.
    Completed,
    /// Shutdown was requested before the range was finished.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub state: RunState,
    pub boundary_id: i64,
    pub completed: usize,
    pub failed: usize,
    pub windows: u64,
    pub stats: StatsSnapshot,
    pub elapsed: Duration,
}

enum WindowEnd {
    /// Every pending item settled.
    Settled,
    /// Shutdown stopped dispatch before every item ran.
    Interrupted,
}

/// Flushes caches every N finished items or every interval, whichever comes first.
struct FlushCadence {
    every: u64,
    interval: Duration,
    since_flush: u64,
    last_flush: Instant,
}

impl FlushCadence {
    fn new(config: &BatchConfig) -> Self {
        Self {
            every: config.cache_flush_every.max(1),
            interval: config.cache_flush_interval,
            since_flush: 0,
            last_flush: Instant::now(),
        }
    }

    fn tick(&mut self) -> bool {
        self.since_flush += 1;
        self.since_flush >= self.every || self.last_flush.elapsed() >= self.interval
    }

    fn reset(&mut self) {
        self.since_flush = 0;
        self.last_flush = Instant::now();
    }
}

pub struct CheckpointedBatchProcessor {
    ctx: EnrichContext,
    config: BatchConfig,
    shard: ShardSpec,
    checkpoints: CheckpointStore,
    shutdown: ShutdownSignal,
}

impl CheckpointedBatchProcessor {
    pub fn new(
        ctx: EnrichContext,
        config: BatchConfig,
        shard: ShardSpec,
        checkpoints: CheckpointStore,
    ) -> Self {
        Self {
            ctx,
            config,
            shard,
            checkpoints,
            shutdown: ShutdownSignal::never(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shard(&self) -> &ShardSpec {
        &self.shard
    }

    /// Scan the shard until its range is exhausted, shutdown is requested or a fatal
    /// error occurs.
    pub async fn run(&self) -> Result<RunSummary, EnrichError> {
        let started = Instant::now();
        let mut checkpoint = self.resume()?;
        let mut windows = 0;

        let scanned = self.scan(&mut checkpoint, &mut windows).await;
        let finished = self.finish(&mut checkpoint).await;

        let state = match (scanned, finished) {
            (Ok(state), Ok(())) => state,
            (Err(err), finished) => {
                if let Err(save_err) = finished {
                    tracing::error!(error = %save_err, "final save failed after run error");
                }
                return Err(err);
            }
            (Ok(_), Err(err)) => return Err(err),
        };

        let summary = RunSummary {
            state,
            boundary_id: checkpoint.boundary_id,
            completed: checkpoint.completed_ids.len(),
            failed: checkpoint.failed_ids.len(),
            windows,
            stats: self.ctx.stats.snapshot(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            process_id = self.shard.process_id,
            state = ?summary.state,
            boundary_id = summary.boundary_id,
            completed = summary.completed,
            failed = summary.failed,
            api_calls = summary.stats.api_calls,
            cache_hits = summary.stats.cache_hits,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "run finished"
        );
        Ok(summary)
    }

    fn resume(&self) -> Result<Checkpoint, EnrichError> {
        let ShardSpec {
            process_id,
            min_id,
            max_id,
        } = self.shard;

        let mut checkpoint = match self.checkpoints.load()? {
            Some(checkpoint) => {
                if !checkpoint.matches_range(min_id, max_id) {
                    tracing::warn!(
                        process_id,
                        checkpoint_min = ?checkpoint.min_id,
                        checkpoint_max = ?checkpoint.max_id,
                        min_id,
                        max_id,
                        "checkpoint was written for a different range"
                    );
                }
                tracing::info!(
                    process_id,
                    boundary_id = checkpoint.boundary_id,
                    completed = checkpoint.completed_ids.len(),
                    failed = checkpoint.failed_ids.len(),
                    "resuming from checkpoint"
                );
                checkpoint.for_shard(process_id, min_id, max_id)
            }
            None => {
                tracing::info!(process_id, min_id, max_id, "starting fresh");
                Checkpoint::new(min_id).for_shard(process_id, min_id, max_id)
            }
        };
        checkpoint.advance_to(min_id);
        Ok(checkpoint)
    }

    async fn scan(&self, checkpoint: &mut Checkpoint, windows: &mut u64) -> Result<RunState, EnrichError> {
        let span = self.config.batch_size.max(1) - 1;
        let mut cadence = FlushCadence::new(&self.config);

        while checkpoint.boundary_id <= self.shard.max_id {
            if self.shutdown.is_triggered() {
                return Ok(RunState::Interrupted);
            }

            // Inclusive bounds: a shard may end at i64::MAX.
            let start = checkpoint.boundary_id;
            let last = start.saturating_add(span).min(self.shard.max_id);
            *windows += 1;

            match self.run_window(start..=last, checkpoint, &mut cadence).await? {
                WindowEnd::Settled => {
                    checkpoint.advance_to(last.saturating_add(1));
                    self.save_checkpoint(checkpoint)?;
                }
                WindowEnd::Interrupted => {
                    tracing::info!(window_start = start, "shutdown requested, leaving window open");
                    return Ok(RunState::Interrupted);
                }
            }

            if last == self.shard.max_id {
                break;
            }
            self.pause(self.next_window_delay()).await;
        }
        Ok(RunState::Completed)
    }

    /// The inter-batch delay, or the breaker's remaining cooldown when that is longer.
    fn next_window_delay(&self) -> Duration {
        match self.ctx.client.breaker().retry_in() {
            Some(cooldown) if cooldown > self.config.inter_batch_delay => {
                tracing::warn!(
                    wait_secs = cooldown.as_secs_f64(),
                    "circuit open, waiting out the cooldown before the next window"
                );
                cooldown
            }
            _ => self.config.inter_batch_delay,
        }
    }

    async fn run_window(
        &self,
        window: RangeInclusive<i64>,
        checkpoint: &mut Checkpoint,
        cadence: &mut FlushCadence,
    ) -> Result<WindowEnd, EnrichError> {
        let items = self.ctx.sink.work_items(window.clone()).await?;
        let ids: Vec<i64> = items.iter().map(|item| item.id).collect();
        let classified: HashSet<i64> = if ids.is_empty() {
            HashSet::new()
        } else {
            self.ctx.sink.classified_ids(&ids).await?
        };

        let pending: Vec<WorkItem> = items
            .into_iter()
            .filter(|item| !classified.contains(&item.id) && !checkpoint.is_settled(item.id))
            .collect();
        let skipped = ids.len() - pending.len();
        self.ctx.stats.record_items_skipped(skipped as u64);
        tracing::debug!(
            window_start = *window.start(),
            window_end = *window.end(),
            items = ids.len(),
            skipped,
            dispatched = pending.len(),
            "window scanned"
        );

        let dispatched = pending.len();
        let ctx = &self.ctx;
        let shutdown = &self.shutdown;
        let results = stream::iter(pending)
            .take_while(|_| future::ready(!shutdown.is_triggered()))
            .map(|item| async move {
                let outcome = process_item(ctx, &item).await;
                (item.id, outcome)
            })
            .buffer_unordered(self.config.max_workers.max(1));
        let mut results = std::pin::pin!(results);

        let mut finished = 0;
        while let Some((id, outcome)) = results.next().await {
            finished += 1;
            match outcome {
                Ok(outcome) => self.settle(checkpoint, id, outcome),
                Err(err) => return Err(self.fatal(id, err)),
            }
            self.after_item(checkpoint, cadence).await;
        }

        if finished < dispatched {
            Ok(WindowEnd::Interrupted)
        } else {
            Ok(WindowEnd::Settled)
        }
    }

    fn settle(&self, checkpoint: &mut Checkpoint, id: i64, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Completed { tags } => {
                tracing::debug!(item_id = id, tags = tags.len(), "item enriched");
                checkpoint.completed_ids.insert(id);
                self.ctx.stats.record_item_completed();
            }
            ItemOutcome::AlreadyPresent => {
                tracing::debug!(item_id = id, "item already enriched elsewhere");
                checkpoint.completed_ids.insert(id);
                self.ctx.stats.record_item_completed();
            }
            ItemOutcome::Failed(reason) => {
                match &reason {
                    FailureReason::NoMatch | FailureReason::NoTags => {
                        tracing::info!(item_id = id, reason = %reason, "item not enriched")
                    }
                    FailureReason::Upstream(_) | FailureReason::Sink(_) => {
                        tracing::warn!(item_id = id, reason = %reason, "item failed")
                    }
                }
                checkpoint.failed_ids.insert(id);
                self.ctx.stats.record_item_failed();
            }
        }
    }

    fn fatal(&self, id: i64, err: ApiError) -> EnrichError {
        tracing::error!(item_id = id, error = %err, "fatal upstream error, stopping");
        EnrichError::Api(err)
    }

    async fn after_item(&self, checkpoint: &mut Checkpoint, cadence: &mut FlushCadence) {
        let snapshot = self.ctx.stats.snapshot();
        let done = snapshot.items_completed + snapshot.items_failed;
        if self.config.progress_every > 0 && done % self.config.progress_every == 0 {
            tracing::info!(
                process_id = self.shard.process_id,
                items_done = done,
                completed = snapshot.items_completed,
                failed = snapshot.items_failed,
                api_calls = snapshot.api_calls,
                cache_hits = snapshot.cache_hits,
                success_rate = snapshot.success_rate(),
                boundary_id = checkpoint.boundary_id,
                "progress"
            );
        }

        if cadence.tick() {
            cadence.reset();
            if let Err(err) = self.ctx.client.flush_caches().await {
                tracing::warn!(error = %err, "cache flush failed, will retry");
            }
        }
    }

    fn save_checkpoint(&self, checkpoint: &mut Checkpoint) -> Result<(), EnrichError> {
        checkpoint.cache_size = self.ctx.client.cache_len();
        checkpoint.touch();
        self.checkpoints.save(checkpoint)?;
        Ok(())
    }

    async fn finish(&self, checkpoint: &mut Checkpoint) -> Result<(), EnrichError> {
        let saved = self.save_checkpoint(checkpoint);
        let flushed = self.ctx.client.flush_caches().await.map_err(EnrichError::from);
        saved.and(flushed)
    }

    /// Sleep, waking early on shutdown.
    async fn pause(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}
