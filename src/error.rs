use crate::config::ConfigLoadError;
use store::StoreError;
use thiserror::Error;
use upstream::ApiError;

/// Errors that stop an enrichment run. Per-item failures never surface here;
/// they are recorded in the checkpoint and the run continues.
#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("upstream: {0}")]
    Api(#[from] ApiError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("config: {0}")]
    Config(#[from] ConfigLoadError),

    #[error("invalid id range [{min_id}, {max_id}]")]
    InvalidRange { min_id: i64, max_id: i64 },

    #[error("invalid shard plan: {0}")]
    InvalidPlan(String),
}

impl EnrichError {
    /// True when the run stopped on rejected credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, EnrichError::Api(err) if err.is_fatal())
    }
}
