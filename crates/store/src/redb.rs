//! Redb (embedded, pure Rust) sink.
//!
//! Work items are stored as JSON under their id; tag associations live in a
//! multimap keyed by item id. redb serializes write transactions, so the
//! check-then-insert in [`Sink::upsert_tags`] runs inside a single write
//! transaction and cannot race with another writer.
//!
//! # Configuration Example
//! ```yaml
//! sink:
//!   backend: "redb"
//!   path: "/data/catalog.redb"
//! ```

use crate::{RangeProgress, Sink, StoreError, UpsertOutcome, WorkItem};
use async_trait::async_trait;
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
};
use std::collections::{BTreeSet, HashSet};
use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;

const ITEMS: TableDefinition<i64, &[u8]> = TableDefinition::new("work_items");
const ITEM_TAGS: MultimapTableDefinition<i64, &str> = MultimapTableDefinition::new("item_tags");

/// Redb-backed sink. Cheap to share; every call runs on the blocking pool.
#[derive(Clone)]
pub struct RedbSink {
    db: Arc<Database>,
}

impl RedbSink {
    /// Open or create a database at `path`, creating both tables.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path.as_ref()).map_err(StoreError::backend)?;

        let write_txn = db.begin_write().map_err(StoreError::backend)?;
        {
            write_txn.open_table(ITEMS).map_err(StoreError::backend)?;
            write_txn
                .open_multimap_table(ITEM_TAGS)
                .map_err(StoreError::backend)?;
        }
        write_txn.commit().map_err(StoreError::backend)?;

        tracing::info!(path = %path.as_ref().display(), "opened redb sink");
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(StoreError::backend)?
    }
}

fn has_tags(db: &Database, id: i64) -> Result<bool, StoreError> {
    let read_txn = db.begin_read().map_err(StoreError::backend)?;
    let table = read_txn
        .open_multimap_table(ITEM_TAGS)
        .map_err(StoreError::backend)?;
    let mut values = table.get(id).map_err(StoreError::backend)?;
    Ok(values.next().is_some())
}

#[async_trait]
impl Sink for RedbSink {
    async fn work_items(&self, range: RangeInclusive<i64>) -> Result<Vec<WorkItem>, StoreError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        self.blocking(move |db| {
            let read_txn = db.begin_read().map_err(StoreError::backend)?;
            let table = read_txn.open_table(ITEMS).map_err(StoreError::backend)?;
            let mut items = Vec::new();
            for entry in table.range(range).map_err(StoreError::backend)? {
                let (_, value) = entry.map_err(StoreError::backend)?;
                items.push(serde_json::from_slice::<WorkItem>(value.value())?);
            }
            Ok(items)
        })
        .await
    }

    async fn classified_ids(&self, ids: &[i64]) -> Result<HashSet<i64>, StoreError> {
        let ids = ids.to_vec();
        self.blocking(move |db| {
            let read_txn = db.begin_read().map_err(StoreError::backend)?;
            let table = read_txn
                .open_multimap_table(ITEM_TAGS)
                .map_err(StoreError::backend)?;
            let mut classified = HashSet::new();
            for id in ids {
                let mut values = table.get(id).map_err(StoreError::backend)?;
                if values.next().is_some() {
                    classified.insert(id);
                }
            }
            Ok(classified)
        })
        .await
    }

    async fn has_result(&self, id: i64) -> Result<bool, StoreError> {
        self.blocking(move |db| has_tags(db, id)).await
    }

    async fn upsert_tags(
        &self,
        id: i64,
        tags: &BTreeSet<String>,
    ) -> Result<UpsertOutcome, StoreError> {
        let tags = tags.clone();
        self.blocking(move |db| {
            let write_txn = db.begin_write().map_err(StoreError::backend)?;
            let outcome = {
                let mut table = write_txn
                    .open_multimap_table(ITEM_TAGS)
                    .map_err(StoreError::backend)?;
                let exists = table
                    .get(id)
                    .map_err(StoreError::backend)?
                    .next()
                    .is_some();
                if exists {
                    UpsertOutcome::AlreadyPresent
                } else {
                    for tag in &tags {
                        table
                            .insert(id, tag.as_str())
                            .map_err(StoreError::backend)?;
                    }
                    UpsertOutcome::Inserted(tags.len())
                }
            };
            write_txn.commit().map_err(StoreError::backend)?;
            Ok(outcome)
        })
        .await
    }

    async fn tags_for(&self, id: i64) -> Result<BTreeSet<String>, StoreError> {
        self.blocking(move |db| {
            let read_txn = db.begin_read().map_err(StoreError::backend)?;
            let table = read_txn
                .open_multimap_table(ITEM_TAGS)
                .map_err(StoreError::backend)?;
            let mut tags = BTreeSet::new();
            for value in table.get(id).map_err(StoreError::backend)? {
                tags.insert(value.map_err(StoreError::backend)?.value().to_string());
            }
            Ok(tags)
        })
        .await
    }

    async fn progress(&self, range: RangeInclusive<i64>) -> Result<RangeProgress, StoreError> {
        let (start, end) = (*range.start(), *range.end());
        if start > end {
            return Err(StoreError::InvalidRange { start, end });
        }
        self.blocking(move |db| {
            let read_txn = db.begin_read().map_err(StoreError::backend)?;
            let items = read_txn.open_table(ITEMS).map_err(StoreError::backend)?;
            let tags = read_txn
                .open_multimap_table(ITEM_TAGS)
                .map_err(StoreError::backend)?;
            let mut progress = RangeProgress::default();
            for entry in items.range(start..=end).map_err(StoreError::backend)? {
                let (key, _) = entry.map_err(StoreError::backend)?;
                progress.total += 1;
                let mut values = tags.get(key.value()).map_err(StoreError::backend)?;
                if values.next().is_some() {
                    progress.classified += 1;
                }
            }
            Ok(progress)
        })
        .await
    }

    async fn import_items(&self, items: Vec<WorkItem>) -> Result<usize, StoreError> {
        self.blocking(move |db| {
            let write_txn = db.begin_write().map_err(StoreError::backend)?;
            let mut added = 0;
            {
                let mut table = write_txn.open_table(ITEMS).map_err(StoreError::backend)?;
                for item in &items {
                    let exists = table.get(item.id).map_err(StoreError::backend)?.is_some();
                    if exists {
                        continue;
                    }
                    let bytes = serde_json::to_vec(item)?;
                    table
                        .insert(item.id, bytes.as_slice())
                        .map_err(StoreError::backend)?;
                    added += 1;
                }
            }
            write_txn.commit().map_err(StoreError::backend)?;
            Ok(added)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tags(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn seeded(dir: &TempDir) -> RedbSink {
        let sink = RedbSink::open(dir.path().join("catalog.redb")).unwrap();
        let items = (1..=20)
            .map(|id| WorkItem::new(id, format!("song {id}")).with_related(format!("artist {id}")))
            .collect();
        assert_eq!(sink.import_items(items).await.unwrap(), 20);
        sink
    }

    #[tokio::test]
    async fn test_redb_work_items_by_range() {
        let dir = TempDir::new().unwrap();
        let sink = seeded(&dir).await;

        let items = sink.work_items(5..=8).await.unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].id, 5);
        assert_eq!(items[0].related_text.as_deref(), Some("artist 5"));
        assert!(sink.work_items(30..=39).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_redb_upsert_is_idempotent_and_durable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.redb");
        {
            let sink = seeded(&dir).await;
            assert_eq!(
                sink.upsert_tags(3, &tags(&["soul", "funk"])).await.unwrap(),
                UpsertOutcome::Inserted(2)
            );
            assert_eq!(
                sink.upsert_tags(3, &tags(&["disco"])).await.unwrap(),
                UpsertOutcome::AlreadyPresent
            );
        }

        let reopened = RedbSink::open(&path).unwrap();
        assert_eq!(reopened.tags_for(3).await.unwrap(), tags(&["funk", "soul"]));
        assert!(reopened.has_result(3).await.unwrap());
        assert!(!reopened.has_result(4).await.unwrap());
    }

    #[tokio::test]
    async fn test_redb_classified_and_progress() {
        let dir = TempDir::new().unwrap();
        let sink = seeded(&dir).await;
        sink.upsert_tags(2, &tags(&["pop"])).await.unwrap();
        sink.upsert_tags(12, &tags(&["rap"])).await.unwrap();

        let classified = sink.classified_ids(&[1, 2, 12, 99]).await.unwrap();
        assert_eq!(classified, HashSet::from([2, 12]));

        let progress = sink.progress(1..=10).await.unwrap();
        assert_eq!(progress, RangeProgress { total: 10, classified: 1 });
    }

    #[tokio::test]
    async fn test_redb_import_skips_existing() {
        let dir = TempDir::new().unwrap();
        let sink = seeded(&dir).await;
        let added = sink
            .import_items(vec![WorkItem::new(1, "dup"), WorkItem::new(21, "fresh")])
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(sink.work_items(1..=1).await.unwrap()[0].primary_text, "song 1");
    }
}
