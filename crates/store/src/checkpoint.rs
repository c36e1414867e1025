//! Per-shard progress record.

use crate::snapshot::{read_json, write_json_atomic};
use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// How far a shard's scan has progressed.
///
/// `boundary_id` is the lower bound for the next scan and never moves backwards.
/// `failed_ids` is a skip list: ids in it are not retried by later runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub boundary_id: i64,
    pub completed_ids: BTreeSet<i64>,
    pub failed_ids: BTreeSet<i64>,
    pub cache_size: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_id: Option<i64>,
}

impl Checkpoint {
    pub fn new(boundary_id: i64) -> Self {
        Self {
            boundary_id,
            completed_ids: BTreeSet::new(),
            failed_ids: BTreeSet::new(),
            cache_size: 0,
            timestamp: Utc::now(),
            process_id: None,
            min_id: None,
            max_id: None,
        }
    }

    /// Stamp the shard identity and assigned range.
    pub fn for_shard(mut self, process_id: u32, min_id: i64, max_id: i64) -> Self {
        self.process_id = Some(process_id);
        self.min_id = Some(min_id);
        self.max_id = Some(max_id);
        self
    }

    /// Move the boundary forward. Lower values are ignored.
    pub fn advance_to(&mut self, boundary_id: i64) {
        self.boundary_id = self.boundary_id.max(boundary_id);
    }

    /// Whether `id` was already settled (completed or failed) by this shard.
    pub fn is_settled(&self, id: i64) -> bool {
        self.completed_ids.contains(&id) || self.failed_ids.contains(&id)
    }

    /// `false` when the checkpoint was stamped with a different range.
    pub fn matches_range(&self, min_id: i64, max_id: i64) -> bool {
        self.min_id.map_or(true, |m| m == min_id) && self.max_id.map_or(true, |m| m == max_id)
    }

    /// Fraction of `[min_id, max_id]` that lies below the boundary.
    pub fn scanned_fraction(&self, min_id: i64, max_id: i64) -> f64 {
        if max_id < min_id {
            return 1.0;
        }
        let (min, max) = (i128::from(min_id), i128::from(max_id));
        let mut boundary = i128::from(self.boundary_id);
        // The boundary saturates at i64::MAX; the top id counts once it is settled.
        if self.boundary_id == i64::MAX && self.is_settled(i64::MAX) {
            boundary += 1;
        }
        let scanned = boundary.clamp(min, max + 1) - min;
        scanned as f64 / (max - min + 1) as f64
    }

    pub fn touch(&mut self) {
        self.timestamp = Utc::now();
    }
}

/// Checkpoint file for one shard: `<state_dir>/checkpoint_<process_id>.json`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_shard(state_dir: &Path, process_id: u32) -> Self {
        Self::new(state_dir.join(format!("checkpoint_{process_id}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the checkpoint. A missing file is a fresh start; an unreadable one is
    /// logged and also treated as a fresh start, since the sink still guards
    /// against duplicate work.
    pub fn load(&self) -> Result<Option<Checkpoint>, StoreError> {
        match read_json::<Checkpoint>(&self.path) {
            Ok(checkpoint) => Ok(checkpoint),
            Err(StoreError::Serde(err)) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "checkpoint unreadable, starting from the beginning of the range"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        write_json_atomic(&self.path, checkpoint)?;
        tracing::debug!(
            path = %self.path.display(),
            boundary_id = checkpoint.boundary_id,
            completed = checkpoint.completed_ids.len(),
            failed = checkpoint.failed_ids.len(),
            "checkpoint saved"
        );
        Ok(())
    }
}
