//! Client side of catalog enrichment: everything between a work item and the
//! quota-limited metadata API.
//!
//! [`ResilientClient`] wraps a [`Transport`] ([`HttpTransport`] in production,
//! [`FixtureTransport`] offline) with the hit and failure caches, the adaptive
//! rate limiter, the circuit breaker and the retry policy. Transports report every
//! call as a tagged [`Outcome`]; the client's retry loop switches on it.

mod cache;
mod client;
mod error;
mod fixture;
mod http;
mod stats;
mod transport;

pub use cache::{CacheEntry, CacheKind, ResponseCache};
pub use client::{ClientConfig, ResilientClient};
pub use error::ApiError;
pub use fixture::{FixtureCatalog, FixtureTransport};
pub use http::{quota_from_headers, retry_after_from_headers, Credentials, HttpConfig, HttpTransport};
pub use stats::{ProcessingStats, StatsSnapshot};
pub use transport::{Operation, Outcome, Reply, Transport};
