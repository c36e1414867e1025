//! Offline transport backed by a static catalog, with scriptable failures.
//!
//! Catalog file format:
//!
//! ```json
//! {
//!   "tracks":   { "Under Pressure": ["queen", "bowie"] },
//!   "entities": { "queen": ["rock", "glam rock"], "bowie": ["art rock"] }
//! }
//! ```
//!
//! Searches for unknown titles match nothing; fetches of unknown entities are 404s.
//! Scripted outcomes (keyed by [`Operation::label`]) are served first, in order.

use crate::transport::{Operation, Outcome, Reply, Transport};
use crate::ApiError;
use async_trait::async_trait;
use dashmap::DashMap;
use resilience::QuotaInfo;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureCatalog {
    /// Search query → related entity ids of the best match.
    #[serde(default)]
    pub tracks: HashMap<String, BTreeSet<String>>,
    /// Entity id → attribute tags.
    #[serde(default)]
    pub entities: HashMap<String, BTreeSet<String>>,
}

impl FixtureCatalog {
    pub fn from_path(path: &Path) -> Result<Self, ApiError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ApiError::Decode(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw).map_err(|e| ApiError::Decode(format!("{}: {e}", path.display())))
    }

    pub fn with_track<I, S>(mut self, query: &str, entity_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tracks
            .insert(query.to_string(), entity_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_entity<I, S>(mut self, id: &str, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities
            .insert(id.to_string(), tags.into_iter().map(Into::into).collect());
        self
    }

    /// Exact query first, then the `track:` part of a fielded query.
    fn lookup_track(&self, query: &str) -> Option<&BTreeSet<String>> {
        self.tracks.get(query).or_else(|| {
            let title = query.strip_prefix("track:")?;
            let title = title.split(" artist:").next().unwrap_or(title);
            self.tracks.get(title.trim())
        })
    }

    fn answer(&self, op: &Operation<'_>) -> Outcome {
        match op {
            Operation::Search { query } => {
                Outcome::Ok(self.lookup_track(query).cloned().unwrap_or_default())
            }
            Operation::FetchEntity { id } => match self.entities.get(*id) {
                Some(tags) => Outcome::Ok(tags.clone()),
                None => Outcome::NotFound,
            },
        }
    }
}

/// Scriptable in-process transport.
#[derive(Debug, Default)]
pub struct FixtureTransport {
    catalog: FixtureCatalog,
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    fallback: Option<Outcome>,
    quota: QuotaInfo,
    latency: Duration,
    calls: DashMap<String, u64>,
    total_calls: AtomicU64,
}

impl FixtureTransport {
    pub fn new(catalog: FixtureCatalog) -> Self {
        Self {
            catalog,
            ..Self::default()
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ApiError> {
        Ok(Self::new(FixtureCatalog::from_path(path)?))
    }

    /// Queue outcomes for the operation labelled `label` (e.g. `fetch_entity:queen`).
    /// They are served before the catalog answer, one per call.
    pub fn script(self, label: &str, outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(label.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Answer every unscripted call with `outcome` instead of the catalog.
    pub fn with_fallback(mut self, outcome: Outcome) -> Self {
        self.fallback = Some(outcome);
        self
    }

    /// Quota hints attached to every reply.
    pub fn with_quota(mut self, quota: QuotaInfo) -> Self {
        self.quota = quota;
        self
    }

    /// Simulated network latency (runs on the tokio clock).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self, label: &str) -> u64 {
        self.calls.get(label).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for FixtureTransport {
    async fn execute(&self, op: &Operation<'_>) -> Reply {
        let label = op.label();
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        *self.calls.entry(label.clone()).or_insert(0) += 1;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(&label)
            .and_then(VecDeque::pop_front);
        let outcome = scripted
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| self.catalog.answer(op));
        Reply::new(outcome).with_quota(self.quota)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> FixtureCatalog {
        FixtureCatalog::default()
            .with_track("Under Pressure", ["queen", "bowie"])
            .with_entity("queen", ["rock"])
    }

    #[tokio::test]
    async fn answers_from_catalog() {
        let transport = FixtureTransport::new(catalog());
        let reply = transport.execute(&Operation::Search { query: "Under Pressure" }).await;
        assert_eq!(
            reply.outcome,
            Outcome::Ok(BTreeSet::from(["bowie".to_string(), "queen".to_string()]))
        );

        let miss = transport.execute(&Operation::Search { query: "Unknown" }).await;
        assert_eq!(miss.outcome, Outcome::Ok(BTreeSet::new()));

        let gone = transport.execute(&Operation::FetchEntity { id: "nobody" }).await;
        assert_eq!(gone.outcome, Outcome::NotFound);
        assert_eq!(transport.total_calls(), 3);
        assert_eq!(transport.calls("search:Unknown"), 1);
    }

    #[tokio::test]
    async fn fielded_query_falls_back_to_title() {
        let transport = FixtureTransport::new(catalog());
        let reply = transport
            .execute(&Operation::Search {
                query: "track:Under Pressure artist:Queen",
            })
            .await;
        assert!(matches!(reply.outcome, Outcome::Ok(ids) if ids.len() == 2));
    }

    #[tokio::test]
    async fn scripted_outcomes_come_first() {
        let transport = FixtureTransport::new(catalog()).script(
            "fetch_entity:queen",
            [Outcome::ServerError { status: 503 }, Outcome::NotFound],
        );
        let op = Operation::FetchEntity { id: "queen" };
        assert_eq!(transport.execute(&op).await.outcome, Outcome::ServerError { status: 503 });
        assert_eq!(transport.execute(&op).await.outcome, Outcome::NotFound);
        assert!(matches!(transport.execute(&op).await.outcome, Outcome::Ok(_)));
        assert_eq!(transport.calls("fetch_entity:queen"), 3);
    }

    #[tokio::test]
    async fn fallback_overrides_catalog() {
        let transport =
            FixtureTransport::new(catalog()).with_fallback(Outcome::Unauthorized { status: 401 });
        let reply = transport.execute(&Operation::FetchEntity { id: "queen" }).await;
        assert_eq!(reply.outcome, Outcome::Unauthorized { status: 401 });
    }

    #[test]
    fn loads_catalog_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"{"tracks": {"Song": ["a1"]}, "entities": {"a1": ["folk"]}}"#,
        )
        .unwrap();
        let loaded = FixtureCatalog::from_path(&path).unwrap();
        assert_eq!(loaded, FixtureCatalog::default().with_track("Song", ["a1"]).with_entity("a1", ["folk"]));

        std::fs::write(&path, "nope").unwrap();
        assert!(matches!(FixtureCatalog::from_path(&path), Err(ApiError::Decode(_))));
    }
}
