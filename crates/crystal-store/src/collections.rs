//! Source-collection and source-file row operations (spec §3 "Source
//! collection"/"Source file", §4.G).

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crystal_core::{SourceCollectionRecord, SourceFileRecord};

use crate::{Store, StoreError};

/// Errors specific to collection/file operations.
#[derive(Debug, Error)]
pub enum CollectionsError {
    /// See [`StoreError`].
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The classification of a file observed during a sync pass, relative to
/// its stored record (spec §4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFileChange {
    /// `file_hash` unchanged: no work.
    Unchanged,
    /// No prior record: insert.
    Added,
    /// `file_hash` differs: update and re-index.
    Updated,
    /// Previously recorded but absent from disk this pass: delete record
    /// (chunks remain).
    Removed,
}

fn row_to_collection(row: &rusqlite::Row<'_>) -> rusqlite::Result<SourceCollectionRecord> {
    let include_globs: String = row.get("include_globs")?;
    let ignore_globs: String = row.get("ignore_globs")?;
    let last_synced_at: Option<String> = row.get("last_synced_at")?;
    Ok(SourceCollectionRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        root_path: row.get("root_path")?,
        include_globs: serde_json::from_str(&include_globs).unwrap_or_default(),
        ignore_globs: serde_json::from_str(&ignore_globs).unwrap_or_default(),
        file_count: row.get("file_count")?,
        chunk_count: row.get("chunk_count")?,
        last_synced_at: last_synced_at.and_then(|s| s.parse::<DateTime<Utc>>().ok()),
    })
}

fn row_to_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<SourceFileRecord> {
    let last_indexed_at: String = row.get("last_indexed_at")?;
    Ok(SourceFileRecord {
        collection_id: row.get("collection_id")?,
        relative_path: row.get("relative_path")?,
        file_hash: row.get("file_hash")?,
        size_bytes: row.get("size_bytes")?,
        chunk_count: row.get("chunk_count")?,
        last_indexed_at: last_indexed_at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    /// Create (or fetch, if already present) a named source collection.
    pub fn upsert_collection(
        &self,
        name: &str,
        root_path: &str,
        include_globs: &[String],
        ignore_globs: &[String],
    ) -> Result<SourceCollectionRecord, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let include_json = serde_json::to_string(include_globs).expect("Vec<String> always serializes");
        let ignore_json = serde_json::to_string(ignore_globs).expect("Vec<String> always serializes");
        conn.execute(
            "INSERT INTO source_collections (name, root_path, include_globs, ignore_globs, file_count, chunk_count)
             VALUES (?1, ?2, ?3, ?4, 0, 0)
             ON CONFLICT(name) DO UPDATE SET root_path = excluded.root_path,
                                             include_globs = excluded.include_globs,
                                             ignore_globs = excluded.ignore_globs",
            params![name, root_path, include_json, ignore_json],
        )?;
        drop(conn);
        Ok(self.get_collection(name)?.expect("just upserted"))
    }

    /// Fetch a collection by name.
    pub fn get_collection(&self, name: &str) -> Result<Option<SourceCollectionRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let row = conn
            .query_row(
                "SELECT id, name, root_path, include_globs, ignore_globs, file_count, chunk_count, last_synced_at
                 FROM source_collections WHERE name = ?1",
                params![name],
                row_to_collection,
            )
            .optional()?;
        Ok(row)
    }

    /// List every known collection.
    pub fn list_collections(&self) -> Result<Vec<SourceCollectionRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, name, root_path, include_globs, ignore_globs, file_count, chunk_count, last_synced_at
             FROM source_collections ORDER BY name",
        )?;
        let rows = stmt.query_map([], row_to_collection)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Refresh a collection's cached counters and `last_synced_at` after a
    /// sync pass completes.
    pub fn update_collection_counters(
        &self,
        collection_id: i64,
        file_count: i64,
        chunk_count: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let now = crystal_core::now_iso8601();
        conn.execute(
            "UPDATE source_collections SET file_count = ?1, chunk_count = ?2, last_synced_at = ?3 WHERE id = ?4",
            params![file_count, chunk_count, now, collection_id],
        )?;
        Ok(())
    }

    /// Look up a source file's stored record within a collection.
    pub fn get_source_file(
        &self,
        collection_id: i64,
        relative_path: &str,
    ) -> Result<Option<SourceFileRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let row = conn
            .query_row(
                "SELECT collection_id, relative_path, file_hash, size_bytes, chunk_count, last_indexed_at
                 FROM source_files WHERE collection_id = ?1 AND relative_path = ?2",
                params![collection_id, relative_path],
                row_to_file,
            )
            .optional()?;
        Ok(row)
    }

    /// All known source files for a collection, keyed conceptually by
    /// relative path (used to detect removed files during sync).
    pub fn list_source_files(&self, collection_id: i64) -> Result<Vec<SourceFileRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT collection_id, relative_path, file_hash, size_bytes, chunk_count, last_indexed_at
             FROM source_files WHERE collection_id = ?1",
        )?;
        let rows = stmt.query_map(params![collection_id], row_to_file)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Classify `relative_path` against its stored record, given the
    /// currently-computed file hash (spec §4.G change detection). Does not
    /// mutate anything; callers act on the classification and then call
    /// [`Store::upsert_source_file`] or [`Store::delete_source_file`].
    pub fn classify_source_file(
        &self,
        collection_id: i64,
        relative_path: &str,
        current_hash: &str,
    ) -> Result<SourceFileChange, StoreError> {
        match self.get_source_file(collection_id, relative_path)? {
            None => Ok(SourceFileChange::Added),
            Some(existing) if existing.file_hash == current_hash => Ok(SourceFileChange::Unchanged),
            Some(_) => Ok(SourceFileChange::Updated),
        }
    }

    /// Insert or update a source file's record after (re-)indexing.
    pub fn upsert_source_file(
        &self,
        collection_id: i64,
        relative_path: &str,
        file_hash: &str,
        size_bytes: i64,
        chunk_count: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let now = crystal_core::now_iso8601();
        conn.execute(
            "INSERT INTO source_files (collection_id, relative_path, file_hash, size_bytes, chunk_count, last_indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(collection_id, relative_path) DO UPDATE SET
                 file_hash = excluded.file_hash,
                 size_bytes = excluded.size_bytes,
                 chunk_count = excluded.chunk_count,
                 last_indexed_at = excluded.last_indexed_at",
            params![collection_id, relative_path, file_hash, size_bytes, chunk_count, now],
        )?;
        Ok(())
    }

    /// Delete a source file's record (chunks already ingested from it
    /// remain in the store, per spec §3 "Source file").
    pub fn delete_source_file(&self, collection_id: i64, relative_path: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "DELETE FROM source_files WHERE collection_id = ?1 AND relative_path = ?2",
            params![collection_id, relative_path],
        )?;
        Ok(())
    }

    /// Total row count across `source_files` (spec §4.N status aggregator).
    pub fn count_source_files(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Ok(conn.query_row("SELECT COUNT(*) FROM source_files", [], |r| r.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_collection_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let c1 = store.upsert_collection("docs", "/tmp/docs", &["**/*.md".into()], &[]).unwrap();
        let c2 = store.upsert_collection("docs", "/tmp/docs2", &["**/*.md".into()], &[]).unwrap();
        assert_eq!(c1.id, c2.id);
        assert_eq!(c2.root_path, "/tmp/docs2");
    }

    #[test]
    fn classify_source_file_detects_added_unchanged_updated() {
        let store = Store::open_in_memory().unwrap();
        let c = store.upsert_collection("docs", "/tmp/docs", &[], &[]).unwrap();

        assert_eq!(
            store.classify_source_file(c.id, "a.md", "hash1").unwrap(),
            SourceFileChange::Added
        );
        store.upsert_source_file(c.id, "a.md", "hash1", 10, 1).unwrap();

        assert_eq!(
            store.classify_source_file(c.id, "a.md", "hash1").unwrap(),
            SourceFileChange::Unchanged
        );
        assert_eq!(
            store.classify_source_file(c.id, "a.md", "hash2").unwrap(),
            SourceFileChange::Updated
        );
    }

    #[test]
    fn delete_source_file_removes_record_only() {
        let store = Store::open_in_memory().unwrap();
        let c = store.upsert_collection("docs", "/tmp/docs", &[], &[]).unwrap();
        store.upsert_source_file(c.id, "a.md", "hash1", 10, 1).unwrap();
        store.delete_source_file(c.id, "a.md").unwrap();
        assert!(store.get_source_file(c.id, "a.md").unwrap().is_none());
    }
}
