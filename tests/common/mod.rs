//! Shared fixtures for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use enrich::store::{
    CheckpointStore, MemorySink, RangeProgress, Sink, StoreError, UpsertOutcome, WorkItem,
};
use enrich::upstream::{ClientConfig, FixtureCatalog, ResilientClient, Transport};
use enrich::{BatchConfig, CheckpointedBatchProcessor, EnrichContext, ShardSpec};
use std::collections::{BTreeSet, HashSet};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const ARTISTS: i64 = 5;

/// Items `Song {id}` for every id in `ids`.
pub fn songs(ids: RangeInclusive<i64>) -> Vec<WorkItem> {
    ids.map(|id| WorkItem::new(id, format!("Song {id}"))).collect()
}

/// Every `Song {id}` resolves to `artist-{id % 5}`, tagged with its own genre plus "rock".
pub fn catalog(ids: RangeInclusive<i64>) -> FixtureCatalog {
    let mut catalog = FixtureCatalog::default();
    for id in ids {
        catalog = catalog.with_track(&format!("Song {id}"), [format!("artist-{}", id % ARTISTS)]);
    }
    for artist in 0..ARTISTS {
        catalog = catalog.with_entity(&format!("artist-{artist}"), [format!("genre-{artist}"), "rock".to_string()]);
    }
    catalog
}

pub fn batch(batch_size: i64, max_workers: usize) -> BatchConfig {
    BatchConfig::default()
        .with_batch_size(batch_size)
        .with_max_workers(max_workers)
        .with_inter_batch_delay(Duration::from_millis(50))
}

pub fn processor(
    client: ResilientClient,
    sink: Arc<dyn Sink>,
    state_dir: &Path,
    shard: ShardSpec,
    batch: BatchConfig,
) -> CheckpointedBatchProcessor {
    let checkpoints = CheckpointStore::for_shard(state_dir, shard.process_id);
    CheckpointedBatchProcessor::new(EnrichContext::new(Arc::new(client), sink), batch, shard, checkpoints)
}

pub fn client(transport: Arc<dyn Transport>) -> ResilientClient {
    ResilientClient::new(transport, ClientConfig::default())
}

/// Wraps a [`MemorySink`] and records what the processor asked of it.
pub struct RecordingSink {
    inner: Arc<MemorySink>,
    windows: Mutex<Vec<RangeInclusive<i64>>>,
    inserted: AtomicUsize,
}

impl RecordingSink {
    pub fn new(inner: Arc<MemorySink>) -> Self {
        Self {
            inner,
            windows: Mutex::new(Vec::new()),
            inserted: AtomicUsize::new(0),
        }
    }

    /// Id ranges requested through `work_items`, in order.
    pub fn windows(&self) -> Vec<RangeInclusive<i64>> {
        self.windows.lock().unwrap().clone()
    }

    /// Upserts that actually wrote tags.
    pub fn inserted(&self) -> usize {
        self.inserted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn work_items(&self, range: RangeInclusive<i64>) -> Result<Vec<WorkItem>, StoreError> {
        self.windows.lock().unwrap().push(range.clone());
        self.inner.work_items(range).await
    }

    async fn classified_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        self.inner.classified_ids(ids).await
    }

    async fn has_result(&self, id: i64) -> Result<bool, StoreError> {
        self.inner.has_result(id).await
    }

    async fn upsert_tags(
        &self,
        id: i64,
        tags: &BTreeSet<String>,
    ) -> Result<UpsertOutcome, StoreError> {
        let outcome = self.inner.upsert_tags(id, tags).await?;
        if matches!(outcome, UpsertOutcome::Inserted(_)) {
            self.inserted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    async fn tags_for(&self, id: i64) -> Result<BTreeSet<String>, StoreError> {
        self.inner.tags_for(id).await
    }

    async fn progress(&self, range: RangeInclusive<i64>) -> Result<RangeProgress, StoreError> {
        self.inner.progress(range).await
    }
}
