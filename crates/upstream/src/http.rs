//! HTTP transport for a Spotify-style catalog API.
//!
//! - `GET {api_base}/search?q=..&type=track&limit=1` yields the artist ids of the
//!   best matching track
//! - `GET {api_base}/artists/{id}` yields the artist's genres
//!
//! Requests carry a client-credentials bearer token that is fetched lazily, reused
//! until shortly before it expires, and refreshed once when the API answers 401.

use crate::transport::{Operation, Outcome, Reply, Transport};
use crate::ApiError;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use resilience::QuotaInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub api_base: String,
    pub token_url: String,
    /// Whole-request timeout in milliseconds.
    #[serde(with = "resilience::serde_millis")]
    pub timeout: Duration,
    #[serde(with = "resilience::serde_millis")]
    pub connect_timeout: Duration,
    /// `type` parameter of the search endpoint.
    pub search_type: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.spotify.com/v1".to_string(),
            token_url: "https://accounts.spotify.com/api/token".to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            search_type: "track".to_string(),
        }
    }
}

/// OAuth client credentials.
#[derive(Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    tracks: Option<TrackPage>,
}

#[derive(Debug, Default, Deserialize)]
struct TrackPage {
    #[serde(default)]
    items: Vec<Track>,
}

#[derive(Debug, Default, Deserialize)]
struct Track {
    #[serde(default)]
    artists: Vec<ArtistRef>,
}

#[derive(Debug, Default, Deserialize)]
struct ArtistRef {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ArtistResponse {
    #[serde(default)]
    genres: Vec<String>,
}

impl SearchResponse {
    /// Artist ids of the first track; empty when nothing matched.
    fn best_match_artist_ids(self) -> BTreeSet<String> {
        self.tracks
            .and_then(|page| page.items.into_iter().next())
            .map(|track| track.artists.into_iter().filter_map(|a| a.id).collect())
            .unwrap_or_default()
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpConfig,
    credentials: Option<Credentials>,
    token: Mutex<Option<CachedToken>>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig, credentials: Option<Credentials>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ApiError::Setup(e.to_string()))?;
        Ok(Self {
            client,
            config,
            credentials,
            token: Mutex::new(None),
        })
    }

    /// Current bearer token, fetching a new one when missing, stale or `force`d.
    /// `Ok(None)` when no credentials are configured.
    async fn bearer_token(&self, force: bool) -> Result<Option<String>, Reply> {
        let Some(credentials) = &self.credentials else {
            return Ok(None);
        };
        let mut cached = self.token.lock().await;
        if !force {
            if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.refresh_at) {
                return Ok(Some(token.value.clone()));
            }
        }

        let response = self
            .client
            .post(&self.config.token_url)
            .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| Reply::new(Outcome::Network(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_from_headers(response.headers());
            // The token endpoint answers 400 for bad client credentials.
            let outcome = match status.as_u16() {
                400 => Outcome::Unauthorized { status: 400 },
                code => Outcome::from_status(code, retry_after),
            };
            tracing::warn!(status = status.as_u16(), "token request rejected");
            return Err(Reply::new(outcome));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Reply::new(Outcome::Network(format!("token decode: {e}"))))?;
        let lifetime = Duration::from_secs(body.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        tracing::debug!(expires_in = body.expires_in, "fetched access token");
        *cached = Some(CachedToken {
            value: body.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(Some(body.access_token))
    }

    async fn send(&self, op: &Operation<'_>, token: Option<&str>) -> Reply {
        let base = self.config.api_base.trim_end_matches('/');
        let request = match op {
            Operation::Search { query } => self.client.get(format!("{base}/search")).query(&[
                ("q", *query),
                ("type", self.config.search_type.as_str()),
                ("limit", "1"),
            ]),
            Operation::FetchEntity { id } => self.client.get(format!("{base}/artists/{id}")),
        };
        let request = match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return Reply::new(Outcome::Network(err.to_string())),
        };
        let quota = quota_from_headers(response.headers());
        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_from_headers(response.headers());
            return Reply::new(Outcome::from_status(status.as_u16(), retry_after)).with_quota(quota);
        }

        let outcome = match op {
            Operation::Search { .. } => match response.json::<SearchResponse>().await {
                Ok(body) => Outcome::Ok(body.best_match_artist_ids()),
                Err(err) => Outcome::Network(format!("search decode: {err}")),
            },
            Operation::FetchEntity { .. } => match response.json::<ArtistResponse>().await {
                Ok(body) => Outcome::Ok(body.genres.into_iter().collect()),
                Err(err) => Outcome::Network(format!("entity decode: {err}")),
            },
        };
        Reply::new(outcome).with_quota(quota)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, op: &Operation<'_>) -> Reply {
        let token = match self.bearer_token(false).await {
            Ok(token) => token,
            Err(reply) => return reply,
        };
        let reply = self.send(op, token.as_deref()).await;
        if !matches!(reply.outcome, Outcome::Unauthorized { status: 401 }) || self.credentials.is_none() {
            return reply;
        }

        tracing::info!(op = op.name(), "access token rejected, refreshing");
        match self.bearer_token(true).await {
            Ok(token) => self.send(op, token.as_deref()).await,
            Err(reply) => reply,
        }
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u64)
}

/// `X-RateLimit-*` headers, when the provider sends them.
pub fn quota_from_headers(headers: &HeaderMap) -> QuotaInfo {
    QuotaInfo {
        remaining: header_u64(headers, "x-ratelimit-remaining"),
        limit: header_u64(headers, "x-ratelimit-limit"),
        reset_epoch_secs: header_u64(headers, "x-ratelimit-reset"),
    }
}

/// `Retry-After` in delta-seconds. HTTP-date values are ignored.
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let secs = raw.trim().parse::<f64>().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}
