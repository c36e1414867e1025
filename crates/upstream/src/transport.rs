//! Transport seam between the resilient client and the wire.
//!
//! A transport never raises on HTTP status codes. Every call comes back as a
//! [`Reply`] whose [`Outcome`] the client's retry loop switches on.

use crate::ApiError;
use async_trait::async_trait;
use resilience::QuotaInfo;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::time::Duration;

/// The two upstream operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation<'a> {
    /// Find the best match for a free-text query; yields related entity ids.
    Search { query: &'a str },
    /// Fetch one entity; yields its attribute tags.
    FetchEntity { id: &'a str },
}

impl Operation<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Search { .. } => "search",
            Operation::FetchEntity { .. } => "fetch_entity",
        }
    }

    pub fn argument(&self) -> &str {
        match self {
            Operation::Search { query } => query,
            Operation::FetchEntity { id } => id,
        }
    }

    /// Stable key: hex SHA-256 of `name:argument`.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name().as_bytes());
        hasher.update(b":");
        hasher.update(self.argument().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Human-readable label, used in logs and fixture scripts.
    pub fn label(&self) -> String {
        format!("{}:{}", self.name(), self.argument())
    }
}

/// What happened to one upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok(BTreeSet<String>),
    RateLimited { retry_after: Option<Duration> },
    NotFound,
    ServerError { status: u16 },
    ClientError { status: u16 },
    Unauthorized { status: u16 },
    /// Connect, timeout or payload decode failure.
    Network(String),
}

impl Outcome {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => Outcome::RateLimited { retry_after },
            404 => Outcome::NotFound,
            401 | 403 => Outcome::Unauthorized { status },
            500..=599 => Outcome::ServerError { status },
            _ => Outcome::ClientError { status },
        }
    }

    /// Single-shot view of the outcome, without the client's caching and retry.
    pub fn into_result(self) -> Result<BTreeSet<String>, ApiError> {
        match self {
            Outcome::Ok(value) => Ok(value),
            Outcome::RateLimited { retry_after } => Err(ApiError::RateLimited { retry_after }),
            Outcome::NotFound => Err(ApiError::NotFound),
            Outcome::ServerError { status } => Err(ApiError::Transient {
                status: Some(status),
                attempts: 1,
            }),
            Outcome::Network(_) => Err(ApiError::Transient {
                status: None,
                attempts: 1,
            }),
            Outcome::ClientError { status } => Err(ApiError::Client { status }),
            Outcome::Unauthorized { status } => Err(ApiError::Auth { status }),
        }
    }
}

/// A call's outcome plus whatever quota hints came with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub outcome: Outcome,
    pub quota: QuotaInfo,
}

impl Reply {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            quota: QuotaInfo::default(),
        }
    }

    pub fn with_quota(mut self, quota: QuotaInfo) -> Self {
        self.quota = quota;
        self
    }
}

impl From<Outcome> for Reply {
    fn from(outcome: Outcome) -> Self {
        Reply::new(outcome)
    }
}

/// Something that can issue upstream operations.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, op: &Operation<'_>) -> Reply;
}
