//! Message-count capture watermarks (spec §3 "Capture state", §4.K).
//!
//! Byte-offset transcript watermarks live in `crystal-watermark` (a small
//! per-process JSON file); this table tracks the hook-based,
//! message-count variant keyed by `(agent_id, source_id)` in the main
//! store, since it needs to be visible across processes sharing the store.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use thiserror::Error;

use crystal_core::CaptureStateRecord;

use crate::{Store, StoreError};

/// Errors specific to capture-state operations.
#[derive(Debug, Error)]
pub enum CaptureStateError {
    /// See [`StoreError`].
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn row_to_capture(row: &rusqlite::Row<'_>) -> rusqlite::Result<CaptureStateRecord> {
    let last_captured_at: String = row.get("last_captured_at")?;
    Ok(CaptureStateRecord {
        agent_id: row.get("agent_id")?,
        source_id: row.get("source_id")?,
        last_message_count: row.get("last_message_count")?,
        cycle_count: row.get("cycle_count")?,
        last_captured_at: last_captured_at.parse::<DateTime<Utc>>().unwrap_or_else(|_| Utc::now()),
    })
}

impl Store {
    /// Current capture-state row for `(agent_id, source_id)`, if any.
    pub fn get_capture_state(
        &self,
        agent_id: &str,
        source_id: &str,
    ) -> Result<Option<CaptureStateRecord>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let row = conn
            .query_row(
                "SELECT agent_id, source_id, last_message_count, cycle_count, last_captured_at
                 FROM capture_state WHERE agent_id = ?1 AND source_id = ?2",
                params![agent_id, source_id],
                row_to_capture,
            )
            .optional()?;
        Ok(row)
    }

    /// Record a new observed message count for `(agent_id, source_id)`,
    /// incrementing the cycle count. If `message_count` is smaller than the
    /// stored count, the caller should treat this as a transcript
    /// compaction event and re-process from index 0 (spec §4.K) — this
    /// method only persists the watermark; the re-process decision is the
    /// caller's.
    pub fn upsert_capture_state(
        &self,
        agent_id: &str,
        source_id: &str,
        message_count: i64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let now = crystal_core::now_iso8601();
        conn.execute(
            "INSERT INTO capture_state (agent_id, source_id, last_message_count, cycle_count, last_captured_at)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(agent_id, source_id) DO UPDATE SET
                 last_message_count = excluded.last_message_count,
                 cycle_count = capture_state.cycle_count + 1,
                 last_captured_at = excluded.last_captured_at",
            params![agent_id, source_id, message_count, now],
        )?;
        Ok(())
    }

    /// Count of distinct `(agent_id, source_id)` capture sessions (spec
    /// §4.N "captured-session count").
    pub fn count_capture_sessions(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        Ok(conn.query_row("SELECT COUNT(*) FROM capture_state", [], |r| r.get(0))?)
    }

    /// Most recent `last_captured_at` across all capture sessions, if any.
    pub fn latest_capture_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let latest: Option<String> =
            conn.query_row("SELECT MAX(last_captured_at) FROM capture_state", [], |r| r.get(0))?;
        Ok(latest.and_then(|s| s.parse::<DateTime<Utc>>().ok()))
    }

    /// Distinct agent ids that have ever captured (spec §4.N union).
    pub fn distinct_capture_agents(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare("SELECT DISTINCT agent_id FROM capture_state ORDER BY agent_id")?;
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

    #[test]
    fn upsert_capture_state_increments_cycle_count() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_capture_state("agent1", "session1", 5).unwrap();
        store.upsert_capture_state("agent1", "session1", 8).unwrap();
        let state = store.get_capture_state("agent1", "session1").unwrap().unwrap();
        assert_eq!(state.last_message_count, 8);
        assert_eq!(state.cycle_count, 2);
    }

    #[test]
    fn unknown_capture_state_is_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_capture_state("agent1", "session1").unwrap().is_none());
    }
}
