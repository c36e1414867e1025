//! Per-shard memo of upstream lookups.
//!
//! Two instances are used: a hit cache for successful lookups and a failure cache
//! for keys known to have no usable result. Entries are never evicted during a run.
//! Each cache persists to its own JSON file through an atomic snapshot.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use store::snapshot::{read_json, write_json_atomic};
use store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: BTreeSet<String>,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(value: BTreeSet<String>) -> Self {
        Self {
            value,
            fetched_at: Utc::now(),
        }
    }
}

/// Which of the two per-shard cache files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Hit,
    Failure,
}

impl CacheKind {
    pub fn file_name(self, process_id: u32) -> String {
        match self {
            CacheKind::Hit => format!("hit_cache_{process_id}.json"),
            CacheKind::Failure => format!("failure_cache_{process_id}.json"),
        }
    }

    pub fn path(self, state_dir: &Path, process_id: u32) -> PathBuf {
        state_dir.join(self.file_name(process_id))
    }
}

/// Concurrent key → tag-set map with optional file persistence.
#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl ResponseCache {
    /// A cache that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the cache file at `path`. A missing file is a cold start; a corrupt
    /// one is logged and also treated as a cold start.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match read_json::<BTreeMap<String, CacheEntry>>(&path) {
            Ok(Some(map)) => map,
            Ok(None) => BTreeMap::new(),
            Err(StoreError::Serde(err)) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "cache file unreadable, starting cold"
                );
                BTreeMap::new()
            }
            Err(err) => return Err(err),
        };
        if !entries.is_empty() {
            tracing::info!(path = %path.display(), entries = entries.len(), "loaded cache");
        }
        Ok(Self {
            entries: entries.into_iter().collect(),
            path: Some(path),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<BTreeSet<String>> {
        self.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert or overwrite an entry.
    pub fn insert(&self, key: String, value: BTreeSet<String>) {
        self.entries.insert(key, CacheEntry::new(value));
        self.dirty.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Copy in every entry of `other` whose key is absent here. Returns how many
    /// entries were added.
    pub fn merge_missing(&self, other: &ResponseCache) -> usize {
        let mut added = 0;
        for entry in other.entries.iter() {
            if !self.entries.contains_key(entry.key()) {
                self.entries.insert(entry.key().clone(), entry.value().clone());
                added += 1;
            }
        }
        if added > 0 {
            self.dirty.store(true, Ordering::Release);
        }
        added
    }

    /// Write the cache to its file if anything changed since the last flush.
    /// Returns the number of entries written, zero when nothing was written.
    pub fn flush(&self) -> Result<usize, StoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(0);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(0);
        }
        let snapshot: BTreeMap<String, CacheEntry> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        if let Err(err) = write_json_atomic(path, &snapshot) {
            self.dirty.store(true, Ordering::Release);
            return Err(err);
        }
        tracing::debug!(path = %path.display(), entries = snapshot.len(), "cache flushed");
        Ok(snapshot.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn file_names_per_shard() {
        assert_eq!(CacheKind::Hit.file_name(2), "hit_cache_2.json");
        assert_eq!(CacheKind::Failure.file_name(2), "failure_cache_2.json");
    }

    #[test]
    fn flush_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = CacheKind::Hit.path(dir.path(), 0);

        let cache = ResponseCache::load(&path).unwrap();
        assert!(cache.is_empty());
        cache.insert("k1".into(), set(&["rock", "pop"]));
        cache.insert("k2".into(), set(&[]));
        assert_eq!(cache.flush().unwrap(), 2);
        // Nothing changed since, so nothing is written.
        assert_eq!(cache.flush().unwrap(), 0);

        let reloaded = ResponseCache::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("k1"), Some(set(&["pop", "rock"])));
        assert_eq!(reloaded.get("k2"), Some(BTreeSet::new()));
        assert!(!reloaded.is_dirty());
    }

    #[test]
    fn interrupted_flush_leaves_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = CacheKind::Failure.path(dir.path(), 1);
        let cache = ResponseCache::load(&path).unwrap();
        cache.insert("gone".into(), BTreeSet::new());
        cache.flush().unwrap();

        std::fs::write(store::snapshot::tmp_path(&path), b"{\"gone\": {\"val").unwrap();

        let reloaded = ResponseCache::load(&path).unwrap();
        assert!(reloaded.contains("gone"));
    }

    #[test]
    fn corrupt_file_starts_cold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hit_cache_0.json");
        std::fs::write(&path, b"[1, 2").unwrap();
        let cache = ResponseCache::load(&path).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn merge_keeps_existing_entries() {
        let target = ResponseCache::in_memory();
        target.insert("shared".into(), set(&["mine"]));
        let source = ResponseCache::in_memory();
        source.insert("shared".into(), set(&["theirs"]));
        source.insert("new".into(), set(&["jazz"]));

        assert_eq!(target.merge_missing(&source), 1);
        assert_eq!(target.get("shared"), Some(set(&["mine"])));
        assert_eq!(target.get("new"), Some(set(&["jazz"])));
    }

    #[test]
    fn in_memory_cache_never_writes() {
        let cache = ResponseCache::in_memory();
        cache.insert("k".into(), set(&["x"]));
        assert_eq!(cache.flush().unwrap(), 0);
        assert!(cache.path().is_none());
    }
}
