use crate::error::EnrichError;
use std::path::Path;
use upstream::{CacheKind, ResponseCache};

/// Copy one shard's hit cache into other shards' hit caches. Entries a target
/// already has are kept. Returns `(process_id, entries added)` per target.
///
/// Failure caches are not shared: a transient failure on one shard says nothing
/// about another shard's next attempt.
pub fn prewarm_caches(
    state_dir: &Path,
    from_process: u32,
    to_processes: &[u32],
) -> Result<Vec<(u32, usize)>, EnrichError> {
    let source = ResponseCache::load(CacheKind::Hit.path(state_dir, from_process))?;
    if source.is_empty() {
        tracing::warn!(from_process, "source hit cache is empty, nothing to copy");
    }

    let mut added = Vec::with_capacity(to_processes.len());
    for &target_id in to_processes.iter().filter(|&&id| id != from_process) {
        let target = ResponseCache::load(CacheKind::Hit.path(state_dir, target_id))?;
        let count = target.merge_missing(&source);
        target.flush()?;
        tracing::info!(
            from_process,
            to_process = target_id,
            added = count,
            total = target.len(),
            "cache prewarmed"
        );
        added.push((target_id, count));
    }
    Ok(added)
}
