//! Single-file embedded store (spec §3, §4.B, §4.N).
//!
//! Backed by `rusqlite` (bundled SQLite) with two virtual indices: a
//! fixed-dimension cosine vector index from `sqlite-vec`, and an FTS5
//! full-text index with Porter stemming over `unicode61`. Schema creation
//! is idempotent on [`Store::open`]; the store runs in WAL journal mode so
//! a background poller and an interactive adapter can share the file with
//! one writer and many readers (spec §5).

#![deny(unsafe_code)]

mod capture;
mod chunks;
mod collections;
mod memory;
mod private_init;
mod status;

pub use capture::CaptureStateError;
pub use chunks::{ChunkRow, ChunksError, PutChunkItem};
pub use collections::{CollectionsError, SourceFileChange};
pub use memory::MemoryError;
pub use status::StatusSnapshot;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use thiserror::Error;

/// Errors produced by the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// An ingestion batch's embedding dimension disagreed with the
    /// dimension already fixed for this store (spec §3 Vector row
    /// invariant).
    #[error("embedding dimension {got} does not match store dimension {expected}")]
    DimensionMismatch {
        /// Dimension carried by the offending batch.
        got: usize,
        /// Dimension already fixed for this store.
        expected: usize,
    },
    /// A batch offered to `put_chunks` was empty.
    #[error("put_chunks called with an empty batch")]
    EmptyBatch,
    /// Row-mapping or (de)serialization failure.
    #[error("row decode: {0}")]
    Decode(String),
}

/// Handle to the embedded store file. Internally serializes all writes
/// through a mutex, matching the single-writer model in spec §5; readers
/// on other connections/processes are unaffected because the store is
/// opened in WAL mode.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if absent) the store file at `path`, running idempotent
    /// schema setup.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        private_init::register_vector_extension();
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        private_init::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open a private, non-persistent store, used by tests.
    #[cfg(any(test, feature = "test-util"))]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        private_init::register_vector_extension();
        private_init::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_is_idempotent_to_reopen_schema() {
        let store = Store::open_in_memory().unwrap();
        // Re-running schema setup against the same connection must not fail.
        let conn = store.conn.lock().unwrap();
        private_init::init_schema(&conn).unwrap();
    }

    #[test]
    fn opens_file_backed_store_and_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crystal.db");
        let _store = Store::open(&path).unwrap();
        assert!(path.exists());
    }
}
