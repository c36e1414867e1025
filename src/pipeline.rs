//! Per-item enrichment: search, fetch related entities, union their tags, upsert.

use crate::context::EnrichContext;
use std::collections::BTreeSet;
use std::fmt;
use store::{StoreError, UpsertOutcome, WorkItem};
use upstream::ApiError;

/// Why an item ended up in `failed_ids`.
#[derive(Debug)]
pub enum FailureReason {
    /// The search found no candidate.
    NoMatch,
    /// Every related entity came back without tags.
    NoTags,
    Upstream(ApiError),
    Sink(StoreError),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoMatch => f.write_str("no match"),
            FailureReason::NoTags => f.write_str("no tags"),
            FailureReason::Upstream(err) => write!(f, "upstream: {err}"),
            FailureReason::Sink(err) => write!(f, "sink: {err}"),
        }
    }
}

/// Result of running one work item through the pipeline.
#[derive(Debug)]
pub enum ItemOutcome {
    /// Tags were written for the item.
    Completed { tags: BTreeSet<String> },
    /// Another worker or process wrote a result first.
    AlreadyPresent,
    Failed(FailureReason),
}

impl ItemOutcome {
    /// Completed or already present: the item needs no more work.
    pub fn is_completed(&self) -> bool {
        matches!(self, ItemOutcome::Completed { .. } | ItemOutcome::AlreadyPresent)
    }
}

/// Search query for an item: fielded when a performer is known.
pub fn search_query(item: &WorkItem) -> String {
    let performer = item
        .related_text
        .as_deref()
        .and_then(|related| related.split(',').next())
        .map(str::trim)
        .filter(|p| !p.is_empty());
    match performer {
        Some(performer) => format!("track:{} artist:{}", item.primary_text.trim(), performer),
        None => item.primary_text.trim().to_string(),
    }
}

/// Run one item. `Err` is reserved for fatal upstream errors; everything else is an
/// [`ItemOutcome`].
pub async fn process_item(ctx: &EnrichContext, item: &WorkItem) -> Result<ItemOutcome, ApiError> {
    let query = search_query(item);
    let entity_ids = match ctx.client.search(&query).await {
        Ok(ids) => ids,
        Err(err) => return classify(item.id, err),
    };

    let mut tags = BTreeSet::new();
    let mut last_error = None;
    for entity_id in &entity_ids {
        match ctx.client.fetch_entity(entity_id).await {
            Ok(entity_tags) => tags.extend(entity_tags),
            Err(ApiError::NotFound) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(ApiError::CircuitOpen) => {
                // Remaining fetches would fail fast too.
                last_error = Some(ApiError::CircuitOpen);
                break;
            }
            Err(err) => {
                tracing::debug!(item_id = item.id, entity_id = %entity_id, error = %err, "entity fetch failed");
                last_error = Some(err);
            }
        }
    }

    if tags.is_empty() {
        let reason = match last_error {
            Some(err) => FailureReason::Upstream(err),
            None => FailureReason::NoTags,
        };
        return Ok(ItemOutcome::Failed(reason));
    }

    Ok(persist(ctx, item.id, tags).await)
}

fn classify(item_id: i64, err: ApiError) -> Result<ItemOutcome, ApiError> {
    match err {
        err if err.is_fatal() => Err(err),
        ApiError::NotFound => Ok(ItemOutcome::Failed(FailureReason::NoMatch)),
        err => {
            tracing::debug!(item_id, error = %err, "search failed");
            Ok(ItemOutcome::Failed(FailureReason::Upstream(err)))
        }
    }
}

async fn persist(ctx: &EnrichContext, item_id: i64, tags: BTreeSet<String>) -> ItemOutcome {
    // Re-check right before writing; a concurrent shard may have finished this id.
    match ctx.sink.has_result(item_id).await {
        Ok(true) => return ItemOutcome::AlreadyPresent,
        Ok(false) => {}
        Err(err) => return ItemOutcome::Failed(FailureReason::Sink(err)),
    }
    match ctx.sink.upsert_tags(item_id, &tags).await {
        Ok(UpsertOutcome::Inserted(_)) => ItemOutcome::Completed { tags },
        Ok(UpsertOutcome::AlreadyPresent) => ItemOutcome::AlreadyPresent,
        Err(err) => ItemOutcome::Failed(FailureReason::Sink(err)),
    }
}
