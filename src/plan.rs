//! Static sharding of an id range across independent processes.
//!
//! Every shard runs its own rate limiter, so the aggregate ceiling is the sum of the
//! per-shard ceilings. Planning divides a global budget evenly to keep that sum at
//! the budget.

use crate::error::EnrichError;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShardPlan {
    pub process_id: u32,
    pub min_id: i64,
    pub max_id: i64,
    /// Per-shard `max_rate_per_minute`.
    pub max_rate: f64,
}

impl ShardPlan {
    /// The `run` invocation for this shard.
    pub fn command_line(&self, program: &str) -> String {
        format!(
            "{program} run --process-id {} --min-id {} --max-id {} --max-rate {:.2}",
            self.process_id, self.min_id, self.max_id, self.max_rate
        )
    }
}

impl fmt::Display for ShardPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shard {:>3}: [{}, {}] at {:.2}/min",
            self.process_id, self.min_id, self.max_id, self.max_rate
        )
    }
}

/// Split `[min_id, max_id]` into `shards` contiguous, disjoint ranges covering it
/// exactly. Earlier shards take the remainder, one id each.
pub fn plan_shards(
    min_id: i64,
    max_id: i64,
    shards: u32,
    global_rate_per_minute: f64,
) -> Result<Vec<ShardPlan>, EnrichError> {
    if min_id > max_id {
        return Err(EnrichError::InvalidRange { min_id, max_id });
    }
    if shards == 0 {
        return Err(EnrichError::InvalidPlan("at least one shard is required".into()));
    }
    if !(global_rate_per_minute > 0.0) {
        return Err(EnrichError::InvalidPlan(format!(
            "global rate must be positive, got {global_rate_per_minute}"
        )));
    }

    let span = max_id.abs_diff(min_id).saturating_add(1);
    if u64::from(shards) > span {
        return Err(EnrichError::InvalidPlan(format!(
            "{shards} shards for only {span} ids"
        )));
    }

    let base = span / u64::from(shards);
    let remainder = span % u64::from(shards);
    let max_rate = global_rate_per_minute / f64::from(shards);

    let mut plans = Vec::with_capacity(shards as usize);
    let mut start = min_id;
    for process_id in 0..shards {
        let width = base + u64::from(u64::from(process_id) < remainder);
        // width >= 1 and the ranges sum to span, so this stays within [min_id, max_id].
        let end = start.wrapping_add((width - 1) as i64);
        plans.push(ShardPlan {
            process_id,
            min_id: start,
            max_id: end,
            max_rate,
        });
        start = end.wrapping_add(1);
    }
    Ok(plans)
}
