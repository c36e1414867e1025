use crate::{RangeProgress, Sink, StoreError, UpsertOutcome, WorkItem};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::RangeInclusive;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryState {
    items: BTreeMap<i64, WorkItem>,
    tags: BTreeMap<i64, BTreeSet<String>>,
}

/// An in-memory sink using a `RwLock` around ordered maps.
#[derive(Debug, Default)]
pub struct MemorySink {
    state: RwLock<MemoryState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let sink = Self::new();
        if let Ok(mut state) = sink.state.write() {
            state.items.extend(items.into_iter().map(|item| (item.id, item)));
        }
        sink
    }

    /// Store a result directly, bypassing the pipeline (seeding tests and fixtures).
    pub fn seed_result(&self, id: i64, tags: impl IntoIterator<Item = String>) -> Result<(), StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?
            .tags
            .insert(id, tags.into_iter().collect());
        Ok(())
    }

    pub fn result_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .state
            .read()
            .map_err(|_| StoreError::backend("poisoned lock"))?
            .tags
            .len())
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn work_items(&self, range: RangeInclusive<i64>) -> Result<Vec<WorkItem>, StoreError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        Ok(state.items.range(range).map(|(_, item)| item.clone()).collect())
    }

    async fn classified_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        Ok(ids
            .iter()
            .copied()
            .filter(|id| state.tags.contains_key(id))
            .collect())
    }

    async fn has_result(&self, id: i64) -> Result<bool, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        Ok(state.tags.contains_key(&id))
    }

    async fn upsert_tags(
        &self,
        id: i64,
        tags: &BTreeSet<String>,
    ) -> Result<UpsertOutcome, StoreError> {
        // Check and insert under one write lock.
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        if state.tags.contains_key(&id) {
            return Ok(UpsertOutcome::AlreadyPresent);
        }
        state.tags.insert(id, tags.clone());
        Ok(UpsertOutcome::Inserted(tags.len()))
    }

    async fn tags_for(&self, id: i64) -> Result<BTreeSet<String>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        Ok(state.tags.get(&id).cloned().unwrap_or_default())
    }

    async fn progress(&self, range: RangeInclusive<i64>) -> Result<RangeProgress, StoreError> {
        if range.start() > range.end() {
            return Err(StoreError::InvalidRange {
                start: *range.start(),
                end: *range.end(),
            });
        }
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        let mut progress = RangeProgress::default();
        for id in state.items.range(range).map(|(id, _)| id) {
            progress.total += 1;
            if state.tags.contains_key(id) {
                progress.classified += 1;
            }
        }
        Ok(progress)
    }

    async fn import_items(&self, items: Vec<WorkItem>) -> Result<usize, StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::backend("poisoned lock"))?;
        let mut added = 0;
        for item in items {
            if let std::collections::btree_map::Entry::Vacant(slot) = state.items.entry(item.id) {
                slot.insert(item);
                added += 1;
            }
        }
        Ok(added)
    }
}
