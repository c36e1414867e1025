//! Read-only progress report for one shard.

use crate::error::EnrichError;
use crate::processor::ShardSpec;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use store::{CheckpointStore, RangeProgress, Sink};
use upstream::{CacheKind, ResponseCache};

#[derive(Debug, Clone, Serialize)]
pub struct ShardStatus {
    pub process_id: u32,
    pub min_id: i64,
    pub max_id: i64,
    /// `None` when the shard has never saved a checkpoint.
    pub boundary_id: Option<i64>,
    pub completed: usize,
    pub failed: usize,
    pub last_saved: Option<DateTime<Utc>>,
    pub scanned_fraction: f64,
    pub hit_cache_entries: usize,
    pub failure_cache_entries: usize,
    /// Classified vs. total items in the range, when a sink was consulted.
    pub sink: Option<RangeProgress>,
}

pub async fn shard_status(
    state_dir: &Path,
    shard: &ShardSpec,
    sink: Option<&dyn Sink>,
) -> Result<ShardStatus, EnrichError> {
    let checkpoint = CheckpointStore::for_shard(state_dir, shard.process_id).load()?;
    let hits = ResponseCache::load(CacheKind::Hit.path(state_dir, shard.process_id))?;
    let failures = ResponseCache::load(CacheKind::Failure.path(state_dir, shard.process_id))?;

    let progress = match sink {
        Some(sink) => Some(sink.progress(shard.min_id..=shard.max_id).await?),
        None => None,
    };

    Ok(ShardStatus {
        process_id: shard.process_id,
        min_id: shard.min_id,
        max_id: shard.max_id,
        boundary_id: checkpoint.as_ref().map(|c| c.boundary_id),
        completed: checkpoint.as_ref().map_or(0, |c| c.completed_ids.len()),
        failed: checkpoint.as_ref().map_or(0, |c| c.failed_ids.len()),
        last_saved: checkpoint.as_ref().map(|c| c.timestamp),
        scanned_fraction: checkpoint
            .as_ref()
            .map_or(0.0, |c| c.scanned_fraction(shard.min_id, shard.max_id)),
        hit_cache_entries: hits.len(),
        failure_cache_entries: failures.len(),
        sink: progress,
    })
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "shard {} [{}, {}]", self.process_id, self.min_id, self.max_id)?;
        match self.boundary_id {
            Some(boundary) => writeln!(
                f,
                "  boundary:  {boundary} ({:.1}% scanned)",
                self.scanned_fraction * 100.0
            )?,
            None => writeln!(f, "  boundary:  not started")?,
        }
        writeln!(f, "  completed: {}", self.completed)?;
        writeln!(f, "  failed:    {}", self.failed)?;
        if let Some(at) = self.last_saved {
            writeln!(f, "  saved at:  {}", at.to_rfc3339())?;
        }
        writeln!(
            f,
            "  caches:    {} hits, {} failures",
            self.hit_cache_entries, self.failure_cache_entries
        )?;
        if let Some(progress) = self.sink {
            writeln!(
                f,
                "  sink:      {}/{} classified ({:.1}%)",
                progress.classified,
                progress.total,
                progress.fraction() * 100.0
            )?;
        }
        Ok(())
    }
}
