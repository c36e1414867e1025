//! Durable state for catalog enrichment.
//!
//! The [`Sink`] trait is the only resource shared between shards: it hands out
//! [`WorkItem`]s by id range and accepts an idempotent upsert of tag associations.
//! Backends:
//!
//! - [`MemorySink`]: process-local, for tests and fixture runs
//! - [`RedbSink`]: embedded redb file (feature `backend-redb`, on by default)
//! - [`PgSink`]: the relational catalog (feature `backend-postgres`)
//!
//! Per-shard progress lives in [`CheckpointStore`]; both checkpoints and the upstream
//! caches are persisted through [`snapshot::write_json_atomic`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub mod checkpoint;
mod memory;
#[cfg(feature = "backend-postgres")]
mod postgres;
#[cfg(feature = "backend-redb")]
mod redb;
pub mod snapshot;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use memory::MemorySink;
#[cfg(feature = "backend-postgres")]
pub use postgres::PgSink;
#[cfg(feature = "backend-redb")]
pub use self::redb::RedbSink;

/// One unit of work: a catalog item to enrich.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    /// Text searched upstream (the song title).
    pub primary_text: String,
    /// Optional disambiguating text (performer names).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_text: Option<String>,
}

impl WorkItem {
    pub fn new(id: i64, primary_text: impl Into<String>) -> Self {
        Self {
            id,
            primary_text: primary_text.into(),
            related_text: None,
        }
    }

    pub fn with_related(mut self, related: impl Into<String>) -> Self {
        self.related_text = Some(related.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("invalid id range {start}..={end}")]
    InvalidRange { start: i64, end: i64 },
    #[error("operation not supported by this sink: {0}")]
    Unsupported(&'static str),
}

impl StoreError {
    pub fn backend<E: std::fmt::Display>(err: E) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Result of [`Sink::upsert_tags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Associations were written; carries the number of tags.
    Inserted(usize),
    /// Another worker or process already stored a result for this item.
    AlreadyPresent,
}

/// Classified vs. total items in an id range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RangeProgress {
    pub total: u64,
    pub classified: u64,
}

impl RangeProgress {
    pub fn remaining(&self) -> u64 {
        self.total.saturating_sub(self.classified)
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.classified as f64 / self.total as f64
        }
    }
}

/// Storage of work items and their persisted tag sets.
///
/// `upsert_tags` must be an atomic check-then-insert: when several workers or
/// processes race on one id, exactly one of them observes [`UpsertOutcome::Inserted`].
#[async_trait]
pub trait Sink: Send + Sync {
    /// All work items with ids in `range`, ordered by id. An inverted range is empty.
    async fn work_items(&self, range: RangeInclusive<i64>) -> Result<Vec<WorkItem>, StoreError>;

    /// The subset of `ids` that already have a persisted result.
    async fn classified_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError>;

    async fn has_result(&self, id: i64) -> Result<bool, StoreError>;

    async fn upsert_tags(
        &self,
        id: i64,
        tags: &BTreeSet<String>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// The persisted tag set for `id`, empty when none.
    async fn tags_for(&self, id: i64) -> Result<BTreeSet<String>, StoreError>;

    async fn progress(&self, range: RangeInclusive<i64>) -> Result<RangeProgress, StoreError>;

    /// Load work items into the sink. Existing ids are left untouched; returns how
    /// many were new.
    async fn import_items(&self, items: Vec<WorkItem>) -> Result<usize, StoreError> {
        let _ = items;
        Err(StoreError::Unsupported("import_items"))
    }
}

/// Which sink backend to build.
///
/// Only `postgres` can be opened by several shard processes at once. A redb file is
/// locked by the first process that opens it, and the memory sink starts empty in
/// every process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum SinkConfig {
    /// Process-local and empty until items are imported. For tests and fixture runs.
    #[default]
    Memory,
    /// Single-process embedded file.
    Redb {
        path: PathBuf,
    },
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    5
}

impl SinkConfig {
    pub fn redb<P: Into<PathBuf>>(path: P) -> Self {
        SinkConfig::Redb { path: path.into() }
    }

    pub fn postgres<S: Into<String>>(url: S) -> Self {
        SinkConfig::Postgres {
            url: url.into(),
            max_connections: default_max_connections(),
        }
    }

    /// Whether concurrent shard processes can share this sink.
    pub fn is_shared(&self) -> bool {
        matches!(self, SinkConfig::Postgres { .. })
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            SinkConfig::Memory => "memory",
            SinkConfig::Redb { .. } => "redb",
            SinkConfig::Postgres { .. } => "postgres",
        }
    }

    /// Build the configured sink. Backends compiled out by feature flags return an error.
    pub async fn build(&self) -> Result<Arc<dyn Sink>, StoreError> {
        match self {
            SinkConfig::Memory => Ok(Arc::new(MemorySink::new())),
            SinkConfig::Redb { path } => {
                #[cfg(feature = "backend-redb")]
                {
                    Ok(Arc::new(RedbSink::open(path)?))
                }
                #[cfg(not(feature = "backend-redb"))]
                {
                    let _ = path;
                    Err(StoreError::backend("redb sink disabled at compile time"))
                }
            }
            SinkConfig::Postgres {
                url,
                max_connections,
            } => {
                #[cfg(feature = "backend-postgres")]
                {
                    Ok(Arc::new(PgSink::connect(url, *max_connections).await?))
                }
                #[cfg(not(feature = "backend-postgres"))]
                {
                    let _ = (url, max_connections);
                    Err(StoreError::backend(
                        "postgres sink disabled at compile time (enable `backend-postgres`)",
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_config_is_tagged_by_backend() {
        let config: SinkConfig = serde_json::from_str(r#"{"backend": "redb", "path": "/tmp/x.redb"}"#).unwrap();
        assert_eq!(config, SinkConfig::redb("/tmp/x.redb"));

        let config: SinkConfig =
            serde_json::from_str(r#"{"backend": "postgres", "url": "postgres://localhost/catalog"}"#)
                .unwrap();
        assert_eq!(config.backend_name(), "postgres");
        assert_eq!(config, SinkConfig::postgres("postgres://localhost/catalog"));

        assert_eq!(SinkConfig::default(), SinkConfig::Memory);
    }

    #[test]
    fn only_postgres_is_shared_across_processes() {
        assert!(SinkConfig::postgres("postgres://localhost/catalog").is_shared());
        assert!(!SinkConfig::redb("/tmp/x.redb").is_shared());
        assert!(!SinkConfig::Memory.is_shared());
    }

    #[test]
    fn range_progress_fraction() {
        let progress = RangeProgress {
            total: 200,
            classified: 50,
        };
        assert_eq!(progress.remaining(), 150);
        assert!((progress.fraction() - 0.25).abs() < f64::EPSILON);
        assert_eq!(RangeProgress::default().fraction(), 1.0);
    }

    #[test]
    fn work_item_omits_missing_related_text() {
        let json = serde_json::to_string(&WorkItem::new(7, "Hey Jude")).unwrap();
        assert_eq!(json, r#"{"id":7,"primary_text":"Hey Jude"}"#);

        let item: WorkItem =
            serde_json::from_str(r#"{"id":8,"primary_text":"Help!","related_text":"The Beatles"}"#)
                .unwrap();
        assert_eq!(item, WorkItem::new(8, "Help!").with_related("The Beatles"));
    }

    #[tokio::test]
    async fn memory_config_builds() {
        let sink = SinkConfig::Memory.build().await.unwrap();
        assert!(!sink.has_result(1).await.unwrap());
    }
}
