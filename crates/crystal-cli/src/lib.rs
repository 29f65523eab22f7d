//! Capability interface and its two variants (spec §9 "Interface
//! polymorphism"): a local variant backed directly by the embedded store,
//! and a remote variant backed by HTTPS against a sibling facade exposing
//! the same six operations. Construction selects a variant from
//! [`crystal_core::Config`].

#![deny(unsafe_code)]

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crystal_core::{ChunkInput, Config, MemoryCategory, QueryFilter, SearchResult};
use crystal_embed::Provider;
use crystal_query::QueryError;
use crystal_store::{Store, StoreError};

/// Errors surfaced by either capability variant.
#[derive(Debug, Error)]
pub enum CliError {
    /// Local store failure.
    #[error("store: {0}")]
    Store(#[from] StoreError),
    /// Local query engine failure.
    #[error("query: {0}")]
    Query(#[from] QueryError),
    /// Local ingestion pipeline failure.
    #[error("ingest: {0}")]
    Ingest(#[from] crystal_ingest::IngestError),
    /// Remote transport failure.
    #[error("remote transport: {0}")]
    Transport(#[from] reqwest::Error),
    /// Remote facade returned a non-2xx status.
    #[error("remote facade returned status {0}")]
    RemoteStatus(reqwest::StatusCode),
    /// Missing configuration needed to build the requested variant.
    #[error("missing configuration: {0}")]
    Config(String),
}

/// Snapshot returned by [`Capability::status`], combining the store's own
/// counters with the caller-supplied provider/data-dir fields the store
/// does not track itself (spec §4.N).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    /// Total chunk count.
    pub chunk_count: i64,
    /// Active memory count.
    pub active_memory_count: i64,
    /// Total indexed source-file row count.
    pub source_row_count: i64,
    /// Distinct agent ids across chunks, sources, and capture state.
    pub distinct_agent_ids: Vec<String>,
    /// Oldest and newest chunk timestamps, ISO-8601, if any chunk exists.
    pub chunk_time_range: Option<(String, String)>,
    /// Distinct capture-session count.
    pub captured_session_count: i64,
    /// Most recent capture timestamp, ISO-8601, if any.
    pub latest_capture_at: Option<String>,
    /// Effective embedding provider name.
    pub embedding_provider: String,
    /// Resolved data directory.
    pub data_dir: String,
}

/// The embedded-store-backed variant.
pub struct LocalCapability {
    store: Store,
    embedder: Provider,
    private_mode_path: PathBuf,
    data_dir: String,
    provider_name: String,
}

impl LocalCapability {
    /// Build a local capability from a resolved [`Config`] and an already
    /// opened [`Store`].
    pub fn new(config: &Config, store: Store, embedder: Provider, provider_name: String) -> Self {
        let private_mode_path = config.data_dir.join("private_mode.json");
        Self { store, embedder, private_mode_path, data_dir: config.data_dir.display().to_string(), provider_name }
    }
}

/// The HTTPS-backed variant, talking to a sibling facade that exposes the
/// same six operations (spec §9). The facade's own wire format is not
/// otherwise specified by the source spec; this implements it as plain
/// bearer-authenticated JSON POSTs, matching the convention already
/// established by the relay protocol.
pub struct RemoteCapability {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl RemoteCapability {
    /// Build a remote capability against `base_url`, authenticating with
    /// `token`.
    pub fn new(base_url: String, token: String) -> Result<Self, CliError> {
        let client = reqwest::Client::builder().timeout(std::time::Duration::from_secs(30)).build()?;
        Ok(Self { base_url, token, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    limit: usize,
    filter: QueryFilter,
}

#[derive(Serialize)]
struct RememberRequest<'a> {
    text: &'a str,
    category: MemoryCategory,
}

#[derive(Serialize, Deserialize)]
struct RememberResponse {
    id: Option<i64>,
}

#[derive(Serialize)]
struct ForgetRequest {
    id: i64,
}

#[derive(Serialize, Deserialize)]
struct ForgetResponse {
    deprecated: bool,
}

#[derive(Serialize)]
struct IngestRequest<'a> {
    candidates: &'a [ChunkInput],
}

#[derive(Serialize, Deserialize)]
struct IngestResponse {
    inserted: usize,
}

#[derive(Serialize)]
struct ChunkTextRequest<'a> {
    text: &'a str,
}

#[derive(Serialize, Deserialize)]
struct ChunkTextResponse {
    chunks: Vec<String>,
}

/// Either variant of the capability interface (spec §9).
pub enum Capability {
    /// Local embedded-store variant.
    Local(LocalCapability),
    /// Remote HTTPS facade variant.
    Remote(RemoteCapability),
}

impl Capability {
    /// Hybrid search (spec §4.F).
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: QueryFilter,
    ) -> Result<Vec<SearchResult>, CliError> {
        match self {
            Capability::Local(local) => {
                Ok(crystal_query::search_now(&local.store, &local.embedder, query, limit, &filter).await?)
            }
            Capability::Remote(remote) => {
                let resp = remote
                    .client
                    .post(remote.url("/v1/search"))
                    .bearer_auth(&remote.token)
                    .json(&SearchRequest { query, limit, filter })
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(CliError::RemoteStatus(resp.status()));
                }
                Ok(resp.json().await?)
            }
        }
    }

    /// Record an explicit Memory fact (spec §4.E `remember`).
    pub async fn remember(&self, text: &str, category: MemoryCategory) -> Result<Option<i64>, CliError> {
        match self {
            Capability::Local(local) => Ok(crystal_ingest::remember(
                &local.store,
                &local.embedder,
                &local.private_mode_path,
                text,
                category,
            )
            .await?),
            Capability::Remote(remote) => {
                let resp = remote
                    .client
                    .post(remote.url("/v1/remember"))
                    .bearer_auth(&remote.token)
                    .json(&RememberRequest { text, category })
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(CliError::RemoteStatus(resp.status()));
                }
                let body: RememberResponse = resp.json().await?;
                Ok(body.id)
            }
        }
    }

    /// Deprecate a Memory fact (spec §4.E `forget`).
    pub async fn forget(&self, id: i64) -> Result<bool, CliError> {
        match self {
            Capability::Local(local) => Ok(crystal_ingest::forget(&local.store, &local.private_mode_path, id)?),
            Capability::Remote(remote) => {
                let resp = remote
                    .client
                    .post(remote.url("/v1/forget"))
                    .bearer_auth(&remote.token)
                    .json(&ForgetRequest { id })
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(CliError::RemoteStatus(resp.status()));
                }
                let body: ForgetResponse = resp.json().await?;
                Ok(body.deprecated)
            }
        }
    }

    /// Store-wide status snapshot (spec §4.N).
    pub async fn status(&self) -> Result<Status, CliError> {
        match self {
            Capability::Local(local) => {
                let snap = local.store.status()?;
                Ok(Status {
                    chunk_count: snap.chunk_count,
                    active_memory_count: snap.active_memory_count,
                    source_row_count: snap.source_row_count,
                    distinct_agent_ids: snap.distinct_agent_ids,
                    chunk_time_range: snap
                        .chunk_time_range
                        .map(|(oldest, newest)| (oldest.to_rfc3339(), newest.to_rfc3339())),
                    captured_session_count: snap.captured_session_count,
                    latest_capture_at: snap.latest_capture_at.map(|t| t.to_rfc3339()),
                    embedding_provider: local.provider_name.clone(),
                    data_dir: local.data_dir.clone(),
                })
            }
            Capability::Remote(remote) => {
                let resp = remote.client.get(remote.url("/v1/status")).bearer_auth(&remote.token).send().await?;
                if !resp.status().is_success() {
                    return Err(CliError::RemoteStatus(resp.status()));
                }
                Ok(resp.json().await?)
            }
        }
    }

    /// Ingest a batch of candidate chunks (spec §4.E), with capture-path
    /// batched retry.
    pub async fn ingest(&self, candidates: &[ChunkInput]) -> Result<usize, CliError> {
        match self {
            Capability::Local(local) => {
                Ok(crystal_ingest::ingest_with_retry(&local.store, &local.embedder, candidates).await?)
            }
            Capability::Remote(remote) => {
                let resp = remote
                    .client
                    .post(remote.url("/v1/ingest"))
                    .bearer_auth(&remote.token)
                    .json(&IngestRequest { candidates })
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(CliError::RemoteStatus(resp.status()));
                }
                let body: IngestResponse = resp.json().await?;
                Ok(body.inserted)
            }
        }
    }

    /// Chunk `text` with the deterministic chunker (spec §4.C). Exposed on
    /// both variants for interface symmetry, even though it performs no
    /// store access.
    pub async fn chunk_text(&self, text: &str) -> Result<Vec<String>, CliError> {
        match self {
            Capability::Local(_) => Ok(crystal_chunker::chunk(text)),
            Capability::Remote(remote) => {
                let resp = remote
                    .client
                    .post(remote.url("/v1/chunk_text"))
                    .bearer_auth(&remote.token)
                    .json(&ChunkTextRequest { text })
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(CliError::RemoteStatus(resp.status()));
                }
                let body: ChunkTextResponse = resp.json().await?;
                Ok(body.chunks)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crystal_embed::OpenAiConfig;

    fn local_capability() -> Capability {
        let store = Store::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            embedding_provider: crystal_core::EmbeddingProvider::OpenAi,
            embedding_api_key: None,
            embedding_model: None,
            embedding_local_host: None,
            relay_url: None,
            relay_token: None,
            relay_key_path: None,
            agent_id: "agent-1".to_string(),
        };
        let embedder = Provider::OpenAi(OpenAiConfig::default());
        Capability::Local(LocalCapability::new(&config, store, embedder, "openai".to_string()))
    }

    #[tokio::test]
    async fn chunk_text_works_without_network_on_local_variant() {
        let cap = local_capability();
        let chunks = cap.chunk_text("just a short sentence.").await.unwrap();
        assert_eq!(chunks, vec!["just a short sentence.".to_string()]);
    }

    #[tokio::test]
    async fn status_reflects_an_empty_store() {
        let cap = local_capability();
        let status = cap.status().await.unwrap();
        assert_eq!(status.chunk_count, 0);
        assert_eq!(status.embedding_provider, "openai");
    }

    #[tokio::test]
    async fn forget_on_nonexistent_memory_returns_false() {
        let cap = local_capability();
        assert!(!cap.forget(999).await.unwrap());
    }
}
