//! Chunk, vector, and FTS row operations (spec §3 "Chunk"/"Vector row"/"FTS
//! row", §4.B contract).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crystal_core::{ChunkInput, ChunkRecord, Role};

use crate::{Store, StoreError};

/// Errors specific to chunk/vector/FTS operations, re-exported alongside
/// the crate-wide [`StoreError`] for callers that want a narrower match.
#[derive(Debug, Error)]
pub enum ChunksError {
    /// See [`StoreError`].
    #[error(transparent)]
    Store(#[from] StoreError),
}

const VECTOR_DIM_KEY: &str = "vector_dim";

/// One candidate offered to [`Store::put_chunks`]: the caller-supplied
/// fields plus the content hash (computed by `crystal-crypto::hash`) and
/// the embedding vector already produced by the embedding client.
#[derive(Debug, Clone)]
pub struct PutChunkItem {
    /// Chunk input fields.
    pub input: ChunkInput,
    /// SHA-256 hex hash of `input.text`.
    pub hash: String,
    /// Embedding vector for `input.text`.
    pub vector: Vec<f32>,
}

/// A raw chunk row as read back from `chunks`, before parsing into
/// [`ChunkRecord`] (kept distinct so callers that only need ids/hashes
/// don't pay for full deserialization).
pub type ChunkRow = ChunkRecord;

fn serialize_vector(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChunkRecord> {
    let role_str: String = row.get("role")?;
    let created_at: String = row.get("created_at")?;
    Ok(ChunkRecord {
        id: row.get("id")?,
        text: row.get("text")?,
        hash: row.get("hash")?,
        role: role_str.parse::<Role>().unwrap_or(Role::User),
        source_type: row.get("source_type")?,
        source_id: row.get("source_id")?,
        agent_id: row.get("agent_id")?,
        token_estimate: row.get("token_estimate")?,
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    /// The store's fixed vector dimension, if any chunk has ever been
    /// stored. Looked up from `schema_meta` first; if that row is somehow
    /// absent but `chunks_vec` holds rows, falls back to peeking the first
    /// row's BLOB length / 4, per spec §4.B.
    pub fn fixed_dimension(&self) -> Result<Option<usize>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let from_meta: Option<String> = conn
            .query_row(
                "SELECT value FROM schema_meta WHERE key = ?1",
                params![VECTOR_DIM_KEY],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(s) = from_meta {
            return Ok(s.parse::<usize>().ok());
        }

        let vec_table_exists: bool = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name='chunks_vec'",
                [],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !vec_table_exists {
            return Ok(None);
        }
        let blob_len: Option<usize> = conn
            .query_row("SELECT length(embedding) FROM chunks_vec LIMIT 1", [], |r| r.get(0))
            .optional()?;
        Ok(blob_len.map(|n| n / 4))
    }

    /// Ensure `chunks_vec` exists with dimension `dim`, fixing it in
    /// `schema_meta` on first call. Subsequent calls with a different `dim`
    /// fail with [`StoreError::DimensionMismatch`].
    fn ensure_vector_table(&self, dim: usize) -> Result<(), StoreError> {
        let existing = self.fixed_dimension()?;
        match existing {
            Some(d) if d != dim => Err(StoreError::DimensionMismatch { got: dim, expected: d }),
            Some(_) => Ok(()),
            None => {
                let conn = self.conn.lock().expect("store mutex poisoned");
                conn.execute_batch(&format!(
                    "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_vec USING vec0(embedding float[{dim}] distance_metric=cosine);"
                ))?;
                conn.execute(
                    "INSERT OR REPLACE INTO schema_meta (key, value) VALUES (?1, ?2)",
                    params![VECTOR_DIM_KEY, dim.to_string()],
                )?;
                Ok(())
            }
        }
    }

    /// Insert a batch of surviving (post-dedup) candidates within one
    /// transaction: chunk row, then vector row under the same id (the FTS
    /// row is populated by the `chunks_ai` trigger). Any failure aborts the
    /// whole batch — no partial writes (spec §4.E).
    pub fn put_chunks(&self, items: &[PutChunkItem]) -> Result<Vec<i64>, StoreError> {
        if items.is_empty() {
            return Err(StoreError::EmptyBatch);
        }
        let dim = items[0].vector.len();
        for item in items {
            if item.vector.len() != dim {
                return Err(StoreError::DimensionMismatch { got: item.vector.len(), expected: dim });
            }
        }
        self.ensure_vector_table(dim)?;

        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(items.len());
        {
            let mut insert_chunk = tx.prepare(
                "INSERT INTO chunks (text, hash, role, source_type, source_id, agent_id, token_estimate, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            let mut insert_vec =
                tx.prepare("INSERT INTO chunks_vec (rowid, embedding) VALUES (?1, ?2)")?;
            for item in items {
                let now = crystal_core::now_iso8601();
                insert_chunk.execute(params![
                    item.input.text,
                    item.hash,
                    item.input.role.as_str(),
                    item.input.source_type,
                    item.input.source_id,
                    item.input.agent_id,
                    item.input.token_estimate(),
                    now,
                ])?;
                let id = tx.last_insert_rowid();
                insert_vec.execute(params![id, serialize_vector(&item.vector)])?;
                ids.push(id);
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    /// True if a chunk with this content hash already exists (dedup check,
    /// spec §4.E).
    pub fn chunk_hash_exists(&self, hash: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let exists = conn
            .query_row("SELECT 1 FROM chunks WHERE hash = ?1", params![hash], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        Ok(exists)
    }

    /// The id of the chunk already stored under this content hash, if any.
    pub fn chunk_id_by_hash(&self, hash: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let id = conn
            .query_row("SELECT id FROM chunks WHERE hash = ?1", params![hash], |r| r.get(0))
            .optional()?;
        Ok(id)
    }

    /// Subset of `hashes` that already exist in the store, queried in one
    /// round trip rather than one `chunk_hash_exists` call per candidate.
    pub fn existing_hashes(
        &self,
        hashes: &[String],
    ) -> Result<std::collections::HashSet<String>, StoreError> {
        if hashes.is_empty() {
            return Ok(std::collections::HashSet::new());
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        let placeholders = hashes.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT hash FROM chunks WHERE hash IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> =
            hashes.iter().map(|h| h as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), |r| r.get::<_, String>(0))?;
        let mut out = std::collections::HashSet::new();
        for r in rows {
            out.insert(r?);
        }
        Ok(out)
    }

    /// Fetch chunk rows by id, in any order (callers re-order).
    pub fn get_chunks_by_id(&self, ids: &[i64]) -> Result<Vec<ChunkRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, text, hash, role, source_type, source_id, agent_id, token_estimate, created_at
             FROM chunks WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = ids.iter().map(|i| i as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(params.as_slice(), row_to_chunk)?;
        let mut out = Vec::with_capacity(ids.len());
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Top-`k` `(chunk_id, cosine_distance)` pairs from the vector index.
    /// Never joins chunk metadata in the same statement (spec §4.B /
    /// Design Notes "Vector-index + relational-join hazard") — call
    /// [`Store::get_chunks_by_id`] separately to fetch metadata.
    pub fn vector_query(&self, query_vector: &[f32], k: usize) -> Result<Vec<(i64, f64)>, StoreError> {
        if self.fixed_dimension()?.is_none() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        let blob = serialize_vector(query_vector);
        let mut stmt = conn.prepare(
            "SELECT rowid, distance FROM chunks_vec WHERE embedding MATCH ?1 AND k = ?2 ORDER BY distance",
        )?;
        let rows = stmt.query_map(params![blob, k as i64], |r| {
            let id: i64 = r.get(0)?;
            let distance: f64 = r.get(1)?;
            Ok((id, distance))
        })?;
        let mut out = Vec::with_capacity(k);
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Top-`k` `(chunk_id, bm25_raw)` pairs from the FTS index, `bm25_raw <=
    /// 0` with lower meaning a better match. `filter` is applied inline in
    /// the same statement (unlike the vector index, a join here is safe).
    pub fn fts_query(
        &self,
        fts_expression: &str,
        k: usize,
        agent_id: Option<&str>,
        source_type: Option<&str>,
    ) -> Result<Vec<(i64, f64)>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT c.id, bm25(chunks_fts) AS score
             FROM chunks_fts
             JOIN chunks c ON c.id = chunks_fts.rowid
             WHERE chunks_fts MATCH ?1
               AND (?2 IS NULL OR c.agent_id = ?2)
               AND (?3 IS NULL OR c.source_type = ?3)
             ORDER BY score ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![fts_expression, agent_id, source_type, k as i64], |r| {
            let id: i64 = r.get(0)?;
            let score: f64 = r.get(1)?;
            Ok((id, score))
        })?;
        let mut out = Vec::with_capacity(k);
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Total chunk count (used by [`crate::status`] and the hybrid query
    /// engine's empty-store short-circuit).
    pub fn count_chunks(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Ok(conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?)
    }

    /// Oldest and newest chunk `created_at`, if any chunk exists.
    pub fn time_range(&self) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let (min, max): (Option<String>, Option<String>) = conn.query_row(
            "SELECT MIN(created_at), MAX(created_at) FROM chunks",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(min.zip(max).and_then(|(min, max)| {
            let min = min.parse::<DateTime<Utc>>().ok()?;
            let max = max.parse::<DateTime<Utc>>().ok()?;
            Some((min, max))
        }))
    }

    /// Distinct agent ids that have ever produced a chunk.
    pub fn distinct_agents(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare("SELECT DISTINCT agent_id FROM chunks ORDER BY agent_id")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crystal_core::Role;

    fn item(text: &str, agent: &str) -> PutChunkItem {
        PutChunkItem {
            input: ChunkInput {
                text: text.to_string(),
                role: Role::User,
                source_type: "conversation".to_string(),
                source_id: "s1".to_string(),
                agent_id: agent.to_string(),
            },
            hash: crystal_crypto::hash(text.as_bytes()),
            vector: vec![0.1, 0.2, 0.3],
        }
    }

    #[test]
    fn put_chunks_creates_chunk_vector_and_fts_rows() {
        let store = Store::open_in_memory().unwrap();
        let ids = store.put_chunks(&[item("hello world", "a1")]).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.count_chunks().unwrap(), 1);
        assert_eq!(store.fixed_dimension().unwrap(), Some(3));
    }

    #[test]
    fn dimension_mismatch_rejected_without_partial_write() {
        let store = Store::open_in_memory().unwrap();
        store.put_chunks(&[item("first", "a1")]).unwrap();
        let mut bad = item("second", "a1");
        bad.vector = vec![0.1, 0.2];
        let err = store.put_chunks(&[bad]);
        assert!(matches!(err, Err(StoreError::DimensionMismatch { got: 2, expected: 3 })));
        assert_eq!(store.count_chunks().unwrap(), 1);
    }

    #[test]
    fn vector_query_never_takes_a_filter_and_fetch_metadata_is_separate() {
        let store = Store::open_in_memory().unwrap();
        store.put_chunks(&[item("alpha", "a1"), item("beta", "a2")]).unwrap();
        let hits = store.vector_query(&[0.1, 0.2, 0.3], 5).unwrap();
        assert_eq!(hits.len(), 2);
        let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
        let metas = store.get_chunks_by_id(&ids).unwrap();
        assert_eq!(metas.len(), 2);
    }

    #[test]
    fn fts_query_finds_matching_text_and_respects_filter() {
        let store = Store::open_in_memory().unwrap();
        store.put_chunks(&[item("deployment policy review", "a1"), item("unrelated text", "a2")]).unwrap();
        let hits = store.fts_query("\"deployment\"*", 10, None, None).unwrap();
        assert_eq!(hits.len(), 1);
        let hits_filtered = store.fts_query("\"deployment\"*", 10, Some("a2"), None).unwrap();
        assert!(hits_filtered.is_empty());
    }

    #[test]
    fn count_chunks_reflects_dedup_free_inserts() {
        let store = Store::open_in_memory().unwrap();
        store.put_chunks(&[item("one", "a1"), item("two", "a1")]).unwrap();
        assert_eq!(store.count_chunks().unwrap(), 2);
    }

    #[test]
    fn distinct_agents_and_time_range() {
        let store = Store::open_in_memory().unwrap();
        store.put_chunks(&[item("one", "a1"), item("two", "a2")]).unwrap();
        assert_eq!(store.distinct_agents().unwrap(), vec!["a1".to_string(), "a2".to_string()]);
        assert!(store.time_range().unwrap().is_some());
    }

    #[test]
    fn empty_batch_rejected() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(store.put_chunks(&[]), Err(StoreError::EmptyBatch)));
    }
}
