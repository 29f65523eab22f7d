//! Memory row operations (spec §3 "Memory", §4.E "Explicit memory ingest").
//!
//! Row operations only; the mirror-chunk ingestion that accompanies
//! `remember` lives in `crystal-ingest` (it needs the embedder).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crystal_core::{MemoryCategory, MemoryRecord, MemoryStatus};

use crate::{Store, StoreError};

/// Errors specific to memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// See [`StoreError`].
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn row_to_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let category: String = row.get("category")?;
    let status: String = row.get("status")?;
    let source_chunk_ids: String = row.get("source_chunk_ids")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(MemoryRecord {
        id: row.get("id")?,
        text: row.get("text")?,
        category: category.parse().unwrap_or(MemoryCategory::Fact),
        confidence: row.get("confidence")?,
        source_chunk_ids: serde_json::from_str(&source_chunk_ids).unwrap_or_default(),
        status: status.parse().unwrap_or(MemoryStatus::Active),
        created_at: created_at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
        updated_at: updated_at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    /// Insert a new, active Memory row. Returns its assigned id; the
    /// mirror-chunk ingestion (spec §3 "Memory") is the caller's
    /// responsibility (`crystal-ingest::remember`).
    pub fn insert_memory(
        &self,
        text: &str,
        category: MemoryCategory,
        confidence: f64,
        source_chunk_ids: &[i64],
    ) -> Result<i64, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let now = crystal_core::now_iso8601();
        let ids_json = serde_json::to_string(source_chunk_ids).expect("Vec<i64> always serializes");
        conn.execute(
            "INSERT INTO memories (text, category, confidence, source_chunk_ids, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![text, category.as_str(), confidence, ids_json, MemoryStatus::Active.as_str(), now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Record the mirror chunk id created for a Memory row (spec §3:
    /// "Upon creation, a mirror Chunk ... is ingested").
    pub fn set_memory_mirror_chunk(&self, memory_id: i64, chunk_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE memories SET mirror_chunk_id = ?1 WHERE id = ?2",
            params![chunk_id, memory_id],
        )?;
        Ok(())
    }

    /// Fetch a single Memory row by id.
    pub fn get_memory(&self, id: i64) -> Result<Option<MemoryRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let row = conn
            .query_row(
                "SELECT id, text, category, confidence, source_chunk_ids, status, created_at, updated_at
                 FROM memories WHERE id = ?1",
                params![id],
                row_to_memory,
            )
            .optional()?;
        Ok(row)
    }

    /// Conditionally transition a Memory row from `active` to
    /// `deprecated`, refreshing `updated_at`. Returns whether any row
    /// changed (spec §4.E `forget`). Never physically deletes the row or
    /// its mirror chunk.
    pub fn deprecate_memory(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let now = crystal_core::now_iso8601();
        let changed = conn.execute(
            "UPDATE memories SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                MemoryStatus::Deprecated.as_str(),
                now,
                id,
                MemoryStatus::Active.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// Count of memories currently `active` (spec §4.N status aggregator).
    pub fn count_active_memories(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE status = ?1",
            params![MemoryStatus::Active.as_str()],
            |r| r.get(0),
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_then_forget_is_logical_only() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_memory("gateway auth token required", MemoryCategory::Fact, 1.0, &[]).unwrap();
        let mem = store.get_memory(id).unwrap().unwrap();
        assert_eq!(mem.status, MemoryStatus::Active);

        let changed = store.deprecate_memory(id).unwrap();
        assert!(changed);
        let mem = store.get_memory(id).unwrap().unwrap();
        assert_eq!(mem.status, MemoryStatus::Deprecated);

        // Row still exists; forgetting again is a no-op (already deprecated).
        let changed_again = store.deprecate_memory(id).unwrap();
        assert!(!changed_again);
    }

    #[test]
    fn forget_unknown_id_returns_false() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.deprecate_memory(9999).unwrap());
    }

    #[test]
    fn active_memory_count_excludes_deprecated() {
        let store = Store::open_in_memory().unwrap();
        let a = store.insert_memory("fact a", MemoryCategory::Fact, 1.0, &[]).unwrap();
        store.insert_memory("fact b", MemoryCategory::Fact, 1.0, &[]).unwrap();
        store.deprecate_memory(a).unwrap();
        assert_eq!(store.count_active_memories().unwrap(), 1);
    }
}
