//! Dedup -> embed -> dual-write ingestion pipeline, explicit memory ingest,
//! and batched retry for capture adapters (spec §4.E).

#![deny(unsafe_code)]

use std::path::Path;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use thiserror::Error;

use crystal_core::{ChunkInput, MemoryCategory};
use crystal_embed::{EmbedError, Provider};
use crystal_store::{PutChunkItem, Store, StoreError};

/// Batches offered to the retrying capture path are capped at this size
/// (spec §4.E "Batches are sized ≤200 for capture flows").
pub const MAX_CAPTURE_BATCH_SIZE: usize = 200;

/// Confidence assigned to memories created via [`remember`]. The spec
/// leaves confidence decay unspecified ("leave as zero-change until a
/// policy is specified" — spec §9 Open Questions); new memories start at
/// full confidence and nothing currently lowers it.
pub const DEFAULT_MEMORY_CONFIDENCE: f64 = 1.0;

/// Errors from the ingestion pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Storage layer failure.
    #[error("store: {0}")]
    Store(#[from] StoreError),
    /// Embedding call failed; per spec, this aborts the whole batch before
    /// any write happens.
    #[error("embedding failed: {0}")]
    Embed(#[from] EmbedError),
    /// Referenced a memory id that does not exist.
    #[error("memory {0} not found")]
    MemoryNotFound(i64),
}

/// Ingest one batch of candidate chunks: hash + dedup, embed survivors in
/// one call, then write chunk+vector rows in a single transaction. Returns
/// the count actually inserted (post-dedup). An embedding failure aborts
/// before any row is written; a transaction failure aborts the whole
/// batch (spec §4.E).
pub async fn ingest_batch(
    store: &Store,
    embedder: &Provider,
    candidates: &[ChunkInput],
) -> Result<usize, IngestError> {
    if candidates.is_empty() {
        return Ok(0);
    }

    let hashes: Vec<String> =
        candidates.iter().map(|c| crystal_crypto::hash(c.text.as_bytes())).collect();
    let existing = store.existing_hashes(&hashes)?;

    let mut seen = std::collections::HashSet::new();
    let mut survivors = Vec::new();
    let mut survivor_hashes = Vec::new();
    for (candidate, hash) in candidates.iter().zip(hashes.iter()) {
        if !existing.contains(hash) && seen.insert(hash.clone()) {
            survivors.push(candidate.clone());
            survivor_hashes.push(hash.clone());
        }
    }
    if survivors.is_empty() {
        tracing::debug!(skipped = candidates.len(), "ingest_batch: all candidates already present");
        return Ok(0);
    }

    let texts: Vec<String> = survivors.iter().map(|c| c.text.clone()).collect();
    let vectors = embedder.embed(&texts).await?;
    if vectors.len() != texts.len() {
        return Err(IngestError::Embed(EmbedError::CountMismatch {
            got: vectors.len(),
            expected: texts.len(),
        }));
    }

    let items: Vec<PutChunkItem> = survivors
        .into_iter()
        .zip(survivor_hashes)
        .zip(vectors)
        .map(|((input, hash), vector)| PutChunkItem { input, hash, vector })
        .collect();

    let ids = store.put_chunks(&items)?;
    tracing::info!(inserted = ids.len(), skipped = candidates.len() - ids.len(), "ingest_batch complete");
    Ok(ids.len())
}

/// Ingest a single candidate, returning the id of the chunk that now
/// represents it — either freshly inserted, or the pre-existing chunk with
/// the same content hash (used by [`remember`], which needs a chunk id to
/// record as the memory's mirror even when the text was already present).
async fn ingest_one_returning_id(
    store: &Store,
    embedder: &Provider,
    candidate: ChunkInput,
) -> Result<i64, IngestError> {
    let hash = crystal_crypto::hash(candidate.text.as_bytes());
    if store.chunk_hash_exists(&hash)? {
        return resolve_chunk_id_by_hash(store, &hash);
    }
    let vectors = embedder.embed(std::slice::from_ref(&candidate.text)).await?;
    let vector = vectors.into_iter().next().ok_or_else(|| {
        IngestError::Embed(EmbedError::CountMismatch { got: 0, expected: 1 })
    })?;
    let ids = store.put_chunks(&[PutChunkItem { input: candidate, hash, vector }])?;
    Ok(ids[0])
}

fn resolve_chunk_id_by_hash(store: &Store, hash: &str) -> Result<i64, IngestError> {
    store.chunk_id_by_hash(hash)?.ok_or_else(|| IngestError::Store(StoreError::Decode(format!(
        "chunk with hash {hash} reported as existing but could not be resolved"
    ))))
}

/// Insert a new active [`crystal_core::MemoryRecord`] and ingest a mirror
/// chunk (`role=system`, `source_type=manual`, `source_id=memory:{id}`) so
/// the fact participates in search (spec §3 "Memory", §4.E). Honors the
/// private-mode gate: if disabled, returns `Ok(None)` as a polite no-op.
pub async fn remember(
    store: &Store,
    embedder: &Provider,
    private_mode_path: &Path,
    text: &str,
    category: MemoryCategory,
) -> Result<Option<i64>, IngestError> {
    if !crystal_watermark::is_enabled(private_mode_path) {
        tracing::info!("remember: private mode active, no-op");
        return Ok(None);
    }

    let memory_id = store.insert_memory(text, category, DEFAULT_MEMORY_CONFIDENCE, &[])?;
    let mirror_input = ChunkInput {
        text: text.to_string(),
        role: crystal_core::Role::System,
        source_type: "manual".to_string(),
        source_id: format!("memory:{memory_id}"),
        agent_id: "system".to_string(),
    };
    let chunk_id = ingest_one_returning_id(store, embedder, mirror_input).await?;
    store.set_memory_mirror_chunk(memory_id, chunk_id)?;
    Ok(Some(memory_id))
}

/// Deprecate a Memory row (status `active -> deprecated`); logical only,
/// the row and its mirror chunk are never deleted (spec §4.E `forget`).
/// Honors the private-mode gate like [`remember`].
pub fn forget(store: &Store, private_mode_path: &Path, id: i64) -> Result<bool, IngestError> {
    if !crystal_watermark::is_enabled(private_mode_path) {
        tracing::info!("forget: private mode active, no-op");
        return Ok(false);
    }
    Ok(store.deprecate_memory(id)?)
}

/// Run [`ingest_batch`] over `candidates`, split into sub-batches of at
/// most [`MAX_CAPTURE_BATCH_SIZE`], each retried up to 4 times with
/// exponential backoff capped at 30s (spec §4.E "Batched retry"). Returns
/// the total count inserted across all sub-batches.
pub async fn ingest_with_retry(
    store: &Store,
    embedder: &Provider,
    candidates: &[ChunkInput],
) -> Result<usize, IngestError> {
    let mut total = 0usize;
    for sub_batch in candidates.chunks(MAX_CAPTURE_BATCH_SIZE) {
        let backoff = ExponentialBuilder::default()
            .with_max_times(4)
            .with_max_delay(Duration::from_secs(30));
        let inserted = (|| async { ingest_batch(store, embedder, sub_batch).await })
            .retry(backoff)
            .notify(|err: &IngestError, delay: Duration| {
                tracing::warn!(?delay, error = %err, "ingest_with_retry: retrying sub-batch");
            })
            .await?;
        total += inserted;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crystal_embed::OpenAiConfig;

    fn candidate(text: &str, agent: &str) -> ChunkInput {
        ChunkInput {
            text: text.to_string(),
            role: crystal_core::Role::User,
            source_type: "conversation".to_string(),
            source_id: "s1".to_string(),
            agent_id: agent.to_string(),
        }
    }

    // A minimal Ollama-shaped HTTP server, bound to an ephemeral loopback
    // port, so `ingest_batch`'s real `embedder.embed` call has something to
    // talk to without reaching the network (matches the real-server style
    // `crystal-deaddrop`'s own integration test uses, rather than bypassing
    // `Provider` entirely).
    async fn spawn_fake_embedder() -> Provider {
        async fn embeddings(
            axum::Json(_req): axum::Json<serde_json::Value>,
        ) -> axum::Json<serde_json::Value> {
            axum::Json(serde_json::json!({ "embedding": [1.0, 0.0, 0.0] }))
        }
        let app = axum::Router::new().route("/api/embeddings", axum::routing::post(embeddings));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Provider::Ollama(crystal_embed::OllamaConfig {
            host: format!("http://{addr}"),
            model: "fake-model".to_string(),
        })
    }

    #[tokio::test]
    async fn ingest_batch_skips_duplicate_hashes_within_one_call() {
        let store = Store::open_in_memory().unwrap();
        let embedder = spawn_fake_embedder().await;
        let dup = candidate("same text", "a1");
        let candidates = vec![dup.clone(), dup];

        let inserted = ingest_batch(&store, &embedder, &candidates).await.unwrap();

        assert_eq!(inserted, 1);
        assert_eq!(store.count_chunks().unwrap(), 1);
    }

    #[tokio::test]
    async fn ingest_batch_skips_duplicate_hashes_across_calls() {
        let store = Store::open_in_memory().unwrap();
        let embedder = spawn_fake_embedder().await;
        let dup = candidate("same text", "a1");

        let first = ingest_batch(&store, &embedder, std::slice::from_ref(&dup)).await.unwrap();
        let second = ingest_batch(&store, &embedder, std::slice::from_ref(&dup)).await.unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 0);
        assert_eq!(store.count_chunks().unwrap(), 1);
    }

    #[tokio::test]
    async fn ingest_batch_empty_input_is_a_noop() {
        let store = Store::open_in_memory().unwrap();
        let embedder = Provider::OpenAi(OpenAiConfig::default());
        let count = ingest_batch(&store, &embedder, &[]).await.unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn forget_unknown_memory_returns_false() {
        let store = Store::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let gate_path = dir.path().join("private_mode.json");
        assert!(!forget(&store, &gate_path, 9999).unwrap());
    }

    #[test]
    fn forget_is_a_noop_when_private_mode_disabled() {
        let store = Store::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let gate_path = dir.path().join("private_mode.json");
        crystal_watermark::set_enabled(&gate_path, false).unwrap();
        let memory_id = store
            .insert_memory("some fact", MemoryCategory::Fact, DEFAULT_MEMORY_CONFIDENCE, &[])
            .unwrap();
        let changed = forget(&store, &gate_path, memory_id).unwrap();
        assert!(!changed);
        // Row is untouched because the gate short-circuited before the
        // store call, not because deprecation failed.
        let mem = store.get_memory(memory_id).unwrap().unwrap();
        assert_eq!(mem.status, crystal_core::MemoryStatus::Active);
    }
}
