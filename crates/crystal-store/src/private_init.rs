//! Schema bootstrap and the one unavoidable `unsafe` call in this crate:
//! registering `sqlite-vec` as an auto-extension so every new connection
//! (including ones opened by other processes against the same file) gets
//! the `vec0` virtual table module.

use std::sync::Once;

use rusqlite::Connection;

use crate::StoreError;

static REGISTER_ONCE: Once = Once::new();

/// Register the `sqlite-vec` extension once per process. `sqlite3_vec_init`
/// is a C ABI entry point; `sqlite3_auto_extension` requires an untyped
/// function pointer, which is the one place this crate must cross the
/// `unsafe` boundary the workspace otherwise denies.
#[allow(unsafe_code)]
pub(crate) fn register_vector_extension() {
    REGISTER_ONCE.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute::<
            *const (),
            unsafe extern "C" fn(
                *mut rusqlite::ffi::sqlite3,
                *mut *mut std::os::raw::c_char,
                *const rusqlite::ffi::sqlite3_api_routines,
            ) -> std::os::raw::c_int,
        >(sqlite_vec::sqlite3_vec_init as *const ())));
    });
}

/// Create every table, trigger, and non-vector index idempotently. The
/// `chunks_vec` virtual table is created lazily on first ingest, once the
/// embedding dimension is known (spec §4.B "Vector dimensionality").
pub(crate) fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chunks (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            text           TEXT NOT NULL,
            hash           TEXT NOT NULL UNIQUE,
            role           TEXT NOT NULL,
            source_type    TEXT NOT NULL,
            source_id      TEXT NOT NULL,
            agent_id       TEXT NOT NULL,
            token_estimate INTEGER NOT NULL,
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS chunks_agent_idx ON chunks(agent_id);
        CREATE INDEX IF NOT EXISTS chunks_source_type_idx ON chunks(source_type);
        CREATE INDEX IF NOT EXISTS chunks_created_at_idx ON chunks(created_at);

        CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            text,
            content='chunks',
            content_rowid='id',
            tokenize='porter unicode61'
        );

        CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
            INSERT INTO chunks_fts(rowid, text) VALUES (new.id, new.text);
        END;

        CREATE TABLE IF NOT EXISTS memories (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            text              TEXT NOT NULL,
            category          TEXT NOT NULL,
            confidence        REAL NOT NULL,
            source_chunk_ids  TEXT NOT NULL,
            status            TEXT NOT NULL,
            mirror_chunk_id   INTEGER,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS memories_status_idx ON memories(status);

        CREATE TABLE IF NOT EXISTS source_collections (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            name            TEXT NOT NULL UNIQUE,
            root_path       TEXT NOT NULL,
            include_globs   TEXT NOT NULL,
            ignore_globs    TEXT NOT NULL,
            file_count      INTEGER NOT NULL DEFAULT 0,
            chunk_count     INTEGER NOT NULL DEFAULT 0,
            last_synced_at  TEXT
        );

        CREATE TABLE IF NOT EXISTS source_files (
            collection_id    INTEGER NOT NULL REFERENCES source_collections(id),
            relative_path    TEXT NOT NULL,
            file_hash        TEXT NOT NULL,
            size_bytes       INTEGER NOT NULL,
            chunk_count      INTEGER NOT NULL,
            last_indexed_at  TEXT NOT NULL,
            PRIMARY KEY (collection_id, relative_path)
        );

        CREATE TABLE IF NOT EXISTS capture_state (
            agent_id          TEXT NOT NULL,
            source_id         TEXT NOT NULL,
            last_message_count INTEGER NOT NULL,
            cycle_count        INTEGER NOT NULL,
            last_captured_at   TEXT NOT NULL,
            PRIMARY KEY (agent_id, source_id)
        );
        "#,
    )?;
    Ok(())
}
