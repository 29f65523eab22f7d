//! Hybrid query engine (spec §4.F): vector ANN + BM25, fused with
//! Reciprocal Rank Fusion, recency-weighted, and rescaled into `(0, 1]`.
//!
//! The two-statement discipline from the Design Notes
//! ("Vector-index + relational-join hazard") is preserved here: the vector
//! side issues [`crystal_store::Store::vector_query`] (no filter) and then
//! a separate metadata fetch; the lexical side's filter is pushed into the
//! single [`crystal_store::Store::fts_query`] statement, where a join is
//! safe.

#![deny(unsafe_code)]

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crystal_core::{ChunkRecord, FreshnessLabel, QueryFilter, Role, SearchResult};
use crystal_embed::{EmbedError, Provider};
use crystal_store::{Store, StoreError};

const RRF_K: f64 = 60.0;
const RRF_WEIGHT: f64 = 1.0;
const RESCALE_FACTOR: f64 = 8.0;
const DEDUP_PREFIX_CHARS: usize = 200;

/// Errors from the hybrid query engine.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Storage layer failure.
    #[error("store: {0}")]
    Store(#[from] StoreError),
    /// Query-embedding failure.
    #[error("query embedding failed: {0}")]
    Embed(#[from] EmbedError),
}

/// Fetch breadth: the number of candidates requested from each ranked
/// list before fusion (spec §4.F step 2).
fn fetch_breadth(limit: usize) -> usize {
    (3 * limit).max(30)
}

/// Strip a query to safe BM25 prefix terms (spec §4.F step 4): split on
/// whitespace, keep Unicode letters/digits/apostrophe, lowercase, drop
/// empties, quote each term as a prefix match, `AND`-join when there is
/// more than one. Returns `None` if no terms survive (vector-only query).
fn build_fts_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|tok| {
            tok.chars()
                .filter(|c| c.is_alphanumeric() || *c == '\'')
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|t| !t.is_empty())
        .collect();
    if terms.is_empty() {
        return None;
    }
    Some(terms.iter().map(|t| format!("\"{t}\"*")).collect::<Vec<_>>().join(" AND "))
}

fn dedup_key(text: &str) -> String {
    text.chars().take(DEDUP_PREFIX_CHARS).collect()
}

/// One entry surviving Reciprocal Rank Fusion, before recency weighting.
struct Fused {
    chunk: ChunkRecord,
    rrf_score: f64,
    best_rank: usize,
}

/// Fuse ranked lists (vector first, then lexical) via RRF, deduplicating by
/// the first 200 characters of text and tracking each entry's best
/// (minimum) rank across lists. Preserves first-seen order so the caller's
/// final sort is stable across equal scores (spec §4.F step 5, §8 property
/// 6/8).
fn rrf_fuse(lists: &[&[ChunkRecord]]) -> Vec<Fused> {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, (ChunkRecord, f64, usize)> = HashMap::new();

    for list in lists {
        for (rank, chunk) in list.iter().enumerate() {
            let key = dedup_key(&chunk.text);
            let contribution = RRF_WEIGHT / (RRF_K + rank as f64 + 1.0);
            match by_key.get_mut(&key) {
                Some(entry) => {
                    entry.1 += contribution;
                    entry.2 = entry.2.min(rank);
                }
                None => {
                    order.push(key.clone());
                    by_key.insert(key, (chunk.clone(), contribution, rank));
                }
            }
        }
    }

    order
        .into_iter()
        .map(|key| {
            let (chunk, score, best_rank) = by_key.remove(&key).expect("key was just inserted");
            let bonus = if best_rank == 0 {
                0.05
            } else if best_rank <= 2 {
                0.02
            } else {
                0.0
            };
            Fused { chunk, rrf_score: score + bonus, best_rank }
        })
        .collect()
}

fn recency_weight(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_days = (now - created_at).num_seconds() as f64 / 86_400.0;
    (1.0 - age_days * 0.01).max(0.5)
}

fn matches_filter(chunk: &ChunkRecord, filter: &QueryFilter) -> bool {
    if let Some(agent_id) = &filter.agent_id {
        if &chunk.agent_id != agent_id {
            return false;
        }
    }
    if let Some(source_type) = &filter.source_type {
        if &chunk.source_type != source_type {
            return false;
        }
    }
    true
}

/// Run the hybrid query, evaluating recency against `now` (callers pass
/// [`chrono::Utc::now`] in production; tests pin a fixed instant). Returns
/// the empty list immediately if the store holds no chunks.
pub async fn search(
    store: &Store,
    embedder: &Provider,
    query: &str,
    limit: usize,
    filter: &QueryFilter,
    now: DateTime<Utc>,
) -> Result<Vec<SearchResult>, QueryError> {
    if store.count_chunks()? == 0 {
        return Ok(Vec::new());
    }
    let k = fetch_breadth(limit);

    // Vector side: embed the query, query the ANN index (no filter), then
    // fetch metadata separately and apply the filter there.
    let query_vectors = embedder.embed(std::slice::from_ref(&query.to_string())).await?;
    let query_vector = query_vectors.into_iter().next().unwrap_or_default();
    let vector_hits = if query_vector.is_empty() {
        Vec::new()
    } else {
        store.vector_query(&query_vector, k)?
    };
    let vector_ids: Vec<i64> = vector_hits.iter().map(|(id, _)| *id).collect();
    let vector_meta: HashMap<i64, ChunkRecord> = store
        .get_chunks_by_id(&vector_ids)?
        .into_iter()
        .map(|c| (c.id, c))
        .collect();
    // score_v = 1 - distance is computed for completeness with the spec's
    // algorithm description, but RRF only consumes rank order, not the
    // underlying score magnitude; this preserves the original rank while
    // honoring the filter in the metadata-fetch step.
    let vector_ranked: Vec<ChunkRecord> = vector_hits
        .into_iter()
        .filter_map(|(id, _distance)| vector_meta.get(&id).cloned())
        .filter(|chunk| matches_filter(chunk, filter))
        .collect();

    // Lexical side: build a safe BM25 expression; empty terms means
    // vector-only (spec §4.F step 4 edge case).
    let lexical_ranked: Vec<ChunkRecord> = match build_fts_expression(query) {
        Some(expr) => {
            let hits = store.fts_query(
                &expr,
                k,
                filter.agent_id.as_deref(),
                filter.source_type.as_deref(),
            )?;
            let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
            let meta: HashMap<i64, ChunkRecord> =
                store.get_chunks_by_id(&ids)?.into_iter().map(|c| (c.id, c)).collect();
            hits.into_iter().filter_map(|(id, _bm25)| meta.get(&id).cloned()).collect()
        }
        None => Vec::new(),
    };

    let fused = rrf_fuse(&[&vector_ranked, &lexical_ranked]);

    let mut results: Vec<SearchResult> = fused
        .into_iter()
        .map(|entry| {
            let recency = recency_weight(entry.chunk.created_at, now);
            let score = (entry.rrf_score * recency * RESCALE_FACTOR).min(1.0);
            let age_days = (now - entry.chunk.created_at).num_seconds() as f64 / 86_400.0;
            SearchResult {
                text: entry.chunk.text,
                role: entry.chunk.role,
                source_type: entry.chunk.source_type,
                source_id: entry.chunk.source_id,
                agent_id: entry.chunk.agent_id,
                created_at: entry.chunk.created_at,
                score,
                freshness_label: FreshnessLabel::from_age_days(age_days),
            }
        })
        .collect();

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(limit);
    Ok(results)
}

/// Convenience wrapper for production callers: evaluates recency against
/// the current instant.
pub async fn search_now(
    store: &Store,
    embedder: &Provider,
    query: &str,
    limit: usize,
    filter: &QueryFilter,
) -> Result<Vec<SearchResult>, QueryError> {
    search(store, embedder, query, limit, filter, Utc::now()).await
}
