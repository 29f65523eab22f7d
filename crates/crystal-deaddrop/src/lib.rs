//! Relay protocol dead-drop server (spec §4.I): a blob store addressable
//! by `<channel>/<uuid>`, fronted by an `axum` HTTP service. The dead drop
//! never decrypts, never parses payloads beyond metadata, never
//! cross-references channels, and never persists anything outside the
//! blob store.

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crystal_core::relay::{
    BlobSummary, Channel, ConfirmResponse, DropResponse, HealthResponse, PickupListResponse,
    BLOB_TTL_SECS, MAX_BLOB_BYTES,
};

/// Errors from dead-drop core operations.
#[derive(Debug, Error)]
pub enum DeadDropError {
    /// Filesystem failure.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// Metadata failed to (de)serialize.
    #[error("metadata decode failed: {0}")]
    Serde(#[from] serde_json::Error),
    /// A dropped body was empty.
    #[error("empty blob body rejected")]
    EmptyBody,
    /// A dropped body exceeded [`MAX_BLOB_BYTES`].
    #[error("blob size {0} exceeds the {MAX_BLOB_BYTES}-byte limit")]
    TooLarge(u64),
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobMeta {
    agent_id: String,
    dropped_at: DateTime<Utc>,
    size: u64,
}

/// A filesystem-backed blob store with one subdirectory per channel.
pub struct DeadDrop {
    root: PathBuf,
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl DeadDrop {
    /// Open (creating if absent) a dead drop rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        for channel in [Channel::Conversations, Channel::Mirror] {
            std::fs::create_dir_all(root.join(channel.as_str()))?;
        }
        Ok(Self { root })
    }

    fn channel_dir(&self, channel: Channel) -> PathBuf {
        self.root.join(channel.as_str())
    }

    fn blob_path(&self, channel: Channel, id: &str) -> PathBuf {
        self.channel_dir(channel).join(format!("{id}.blob"))
    }

    fn meta_path(&self, channel: Channel, id: &str) -> PathBuf {
        self.channel_dir(channel).join(format!("{id}.meta.json"))
    }

    /// Store `body` under a freshly assigned UUID on `channel`. Rejects an
    /// empty body and a body over [`MAX_BLOB_BYTES`] (spec §4.I "Drop").
    pub fn drop(
        &self,
        channel: Channel,
        agent_id: &str,
        body: &[u8],
    ) -> Result<DropResponse, DeadDropError> {
        if body.is_empty() {
            return Err(DeadDropError::EmptyBody);
        }
        let size = body.len() as u64;
        if size > MAX_BLOB_BYTES {
            return Err(DeadDropError::TooLarge(size));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let dropped_at = Utc::now();
        let meta = BlobMeta { agent_id: agent_id.to_string(), dropped_at, size };

        write_atomic(&self.blob_path(channel, &id), body)?;
        write_atomic(&self.meta_path(channel, &id), &serde_json::to_vec(&meta)?)?;

        Ok(DropResponse {
            ok: true,
            id,
            channel: channel.as_str().to_string(),
            size,
            dropped_at: dropped_at.to_rfc3339(),
        })
    }

    /// Enumerate blobs currently held on `channel`, oldest first.
    pub fn list(&self, channel: Channel) -> Result<PickupListResponse, DeadDropError> {
        let mut blobs = Vec::new();
        for entry in std::fs::read_dir(self.channel_dir(channel))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(|s| s.trim_end_matches(".meta").to_string()) else {
                continue;
            };
            let raw = std::fs::read(&path)?;
            let meta: BlobMeta = serde_json::from_slice(&raw)?;
            blobs.push(BlobSummary {
                id,
                size: meta.size,
                dropped_at: meta.dropped_at.to_rfc3339(),
                agent_id: meta.agent_id,
            });
        }
        blobs.sort_by(|a, b| a.dropped_at.cmp(&b.dropped_at));
        Ok(PickupListResponse { channel: channel.as_str().to_string(), count: blobs.len(), blobs })
    }

    /// Read the raw body stored under `id` on `channel`, or `None` if
    /// absent.
    pub fn fetch(&self, channel: Channel, id: &str) -> Result<Option<Vec<u8>>, DeadDropError> {
        let path = self.blob_path(channel, id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(path)?))
    }

    /// Remove the blob and its metadata, returning whether anything was
    /// actually present.
    pub fn confirm(&self, channel: Channel, id: &str) -> Result<bool, DeadDropError> {
        let blob_path = self.blob_path(channel, id);
        if !blob_path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&blob_path)?;
        let _ = std::fs::remove_file(self.meta_path(channel, id));
        Ok(true)
    }

    /// Delete every blob on every channel whose `dropped_at` is older than
    /// [`BLOB_TTL_SECS`] (spec §4.I "TTL sweep" — a safety net; normal
    /// deletion is via confirm). Returns the count removed.
    pub fn sweep_expired(&self) -> Result<usize, DeadDropError> {
        let now = Utc::now();
        let mut removed = 0usize;
        for channel in [Channel::Conversations, Channel::Mirror] {
            let listing = self.list(channel)?;
            for blob in listing.blobs {
                let dropped_at = DateTime::parse_from_rfc3339(&blob.dropped_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or(now);
                let age = (now - dropped_at).num_seconds();
                if age > BLOB_TTL_SECS {
                    self.confirm(channel, &blob.id)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

impl IntoResponse for DeadDropError {
    fn into_response(self) -> Response {
        let status = match &self {
            DeadDropError::EmptyBody | DeadDropError::TooLarge(_) => StatusCode::BAD_REQUEST,
            DeadDropError::Io(_) | DeadDropError::Serde(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct AppState {
    /// The underlying blob store.
    pub dead_drop: Arc<DeadDrop>,
    /// Bearer token -> agent id.
    pub tokens: Arc<HashMap<String, String>>,
}

fn bearer_agent(headers: &HeaderMap, tokens: &HashMap<String, String>) -> Option<String> {
    let raw = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ")?;
    tokens.get(token).cloned()
}

fn parse_channel(raw: &str) -> Result<Channel, Response> {
    raw.parse::<Channel>()
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("unknown channel '{raw}'")).into_response())
}

async fn post_drop(
    State(state): State<AppState>,
    AxumPath(channel): AxumPath<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(agent_id) = bearer_agent(&headers, &state.tokens) else {
        return (StatusCode::FORBIDDEN, "unknown bearer token").into_response();
    };
    let channel = match parse_channel(&channel) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match state.dead_drop.drop(channel, &agent_id, &body) {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_pickup_list(
    State(state): State<AppState>,
    AxumPath(channel): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    if bearer_agent(&headers, &state.tokens).is_none() {
        return (StatusCode::FORBIDDEN, "unknown bearer token").into_response();
    }
    let channel = match parse_channel(&channel) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match state.dead_drop.list(channel) {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_pickup_fetch(
    State(state): State<AppState>,
    AxumPath((channel, id)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if bearer_agent(&headers, &state.tokens).is_none() {
        return (StatusCode::FORBIDDEN, "unknown bearer token").into_response();
    }
    let channel = match parse_channel(&channel) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match state.dead_drop.fetch(channel, &id) {
        Ok(Some(bytes)) => bytes.into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "blob not found").into_response(),
        Err(err) => err.into_response(),
    }
}

async fn delete_confirm(
    State(state): State<AppState>,
    AxumPath((channel, id)): AxumPath<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if bearer_agent(&headers, &state.tokens).is_none() {
        return (StatusCode::FORBIDDEN, "unknown bearer token").into_response();
    }
    let channel = match parse_channel(&channel) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match state.dead_drop.confirm(channel, &id) {
        Ok(true) => Json(ConfirmResponse { ok: true, deleted: true }).into_response(),
        Ok(false) => (StatusCode::NOT_FOUND, "blob not found").into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_health() -> Response {
    Json(HealthResponse {
        ok: true,
        service: "crystal-deaddrop".to_string(),
        mode: "dead-drop".to_string(),
    })
    .into_response()
}

/// Build the axum router for a dead-drop deployment.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/drop/:channel", post(post_drop))
        .route("/pickup/:channel", get(get_pickup_list))
        .route("/pickup/:channel/:id", get(get_pickup_fetch))
        .route("/confirm/:channel/:id", delete(delete_confirm))
        .route("/health", get(get_health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the TTL sweep on a fixed period for as long as the process lives
/// (spec §4.I "TTL sweep"). Intended to be spawned as a background task.
pub async fn run_sweep_loop(dead_drop: Arc<DeadDrop>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match dead_drop.sweep_expired() {
            Ok(removed) if removed > 0 => tracing::info!(removed, "ttl sweep: removed expired blobs"),
            Ok(_) => {}
            Err(err) => tracing::error!(error = %err, "ttl sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_rejects_empty_body() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DeadDrop::open(dir.path()).unwrap();
        let err = dd.drop(Channel::Conversations, "agent-1", &[]).unwrap_err();
        assert!(matches!(err, DeadDropError::EmptyBody));
    }

    #[test]
    fn drop_rejects_oversized_body() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DeadDrop::open(dir.path()).unwrap();
        let oversized = vec![0u8; (MAX_BLOB_BYTES + 1) as usize];
        let err = dd.drop(Channel::Conversations, "agent-1", &oversized).unwrap_err();
        assert!(matches!(err, DeadDropError::TooLarge(size) if size == MAX_BLOB_BYTES + 1));
    }

    #[test]
    fn drop_accepts_a_small_body() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DeadDrop::open(dir.path()).unwrap();
        assert!(dd.drop(Channel::Conversations, "agent-1", &[0u8; 1]).is_ok());
    }

    #[test]
    fn lifecycle_drop_list_fetch_confirm() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DeadDrop::open(dir.path()).unwrap();

        let dropped = dd.drop(Channel::Conversations, "agent-1", b"hello world").unwrap();
        assert_eq!(dropped.size, 11);

        let listing = dd.list(Channel::Conversations).unwrap();
        assert_eq!(listing.count, 1);
        assert_eq!(listing.blobs[0].id, dropped.id);
        assert_eq!(listing.blobs[0].agent_id, "agent-1");

        let fetched = dd.fetch(Channel::Conversations, &dropped.id).unwrap().unwrap();
        assert_eq!(fetched, b"hello world");

        assert!(dd.confirm(Channel::Conversations, &dropped.id).unwrap());
        assert!(dd.fetch(Channel::Conversations, &dropped.id).unwrap().is_none());
        assert!(!dd.confirm(Channel::Conversations, &dropped.id).unwrap());
    }

    #[test]
    fn channels_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let dd = DeadDrop::open(dir.path()).unwrap();
        dd.drop(Channel::Conversations, "agent-1", b"conv body").unwrap();
        dd.drop(Channel::Mirror, "agent-1", b"mirror body").unwrap();

        assert_eq!(dd.list(Channel::Conversations).unwrap().count, 1);
        assert_eq!(dd.list(Channel::Mirror).unwrap().count, 1);
    }

    #[test]
    fn bearer_agent_resolves_known_token_only() {
        let mut tokens = HashMap::new();
        tokens.insert("secret-token".to_string(), "agent-1".to_string());

        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, "Bearer secret-token".parse().unwrap());
        assert_eq!(bearer_agent(&headers, &tokens), Some("agent-1".to_string()));

        let mut bad_headers = HeaderMap::new();
        bad_headers.insert(axum::http::header::AUTHORIZATION, "Bearer nope".parse().unwrap());
        assert_eq!(bearer_agent(&bad_headers, &tokens), None);
    }

    #[test]
    fn parse_channel_rejects_unknown_names() {
        assert!(parse_channel("conversations").is_ok());
        assert!(parse_channel("mirror").is_ok());
        assert!(parse_channel("secrets").is_err());
    }
}
