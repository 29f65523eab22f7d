//! Read-only status aggregator (spec §4.N): plain counters over the store,
//! no independent state of its own.

use chrono::{DateTime, Utc};

use crate::{Store, StoreError};

/// A point-in-time snapshot of store-wide counters, assembled by the
/// status aggregator. Provider/data-dir fields are supplied by the caller
/// (they come from `crystal-core::Config`, which this crate does not
/// depend on) via [`Store::status`]'s arguments.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// Total chunk count.
    pub chunk_count: i64,
    /// Active (non-deprecated, non-deleted) memory count.
    pub active_memory_count: i64,
    /// Total source-file row count.
    pub source_row_count: i64,
    /// Distinct agent ids across chunks, source collections, and capture
    /// state.
    pub distinct_agent_ids: Vec<String>,
    /// Oldest/newest chunk timestamps, if any chunk exists.
    pub chunk_time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Distinct `(agent_id, source_id)` capture sessions.
    pub captured_session_count: i64,
    /// Most recent capture timestamp, if any.
    pub latest_capture_at: Option<DateTime<Utc>>,
}

impl Store {
    /// Assemble a [`StatusSnapshot`] over the store's own tables. The
    /// effective embedding provider and data directory are not store state
    /// and are reported by the caller (`crystal-cli`) alongside this.
    pub fn status(&self) -> Result<StatusSnapshot, StoreError> {
        let mut agents: std::collections::BTreeSet<String> =
            self.distinct_agents()?.into_iter().collect();
        agents.extend(self.distinct_capture_agents()?);

        Ok(StatusSnapshot {
            chunk_count: self.count_chunks()?,
            active_memory_count: self.count_active_memories()?,
            source_row_count: self.count_source_files()?,
            distinct_agent_ids: agents.into_iter().collect(),
            chunk_time_range: self.time_range()?,
            captured_session_count: self.count_capture_sessions()?,
            latest_capture_at: self.latest_capture_timestamp()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crystal_core::{ChunkInput, Role};

    #[test]
    fn status_reflects_chunks_and_capture_state() {
        let store = Store::open_in_memory().unwrap();
        let input = ChunkInput {
            text: "hello".to_string(),
            role: Role::User,
            source_type: "conversation".to_string(),
            source_id: "s1".to_string(),
            agent_id: "agentA".to_string(),
        };
        store
            .put_chunks(&[crate::PutChunkItem {
                hash: crystal_crypto::hash(input.text.as_bytes()),
                input,
                vector: vec![0.1, 0.2],
            }])
            .unwrap();
        store.upsert_capture_state("agentB", "session1", 3).unwrap();

        let snap = store.status().unwrap();
        assert_eq!(snap.chunk_count, 1);
        assert_eq!(snap.captured_session_count, 1);
        assert_eq!(snap.distinct_agent_ids, vec!["agentA".to_string(), "agentB".to_string()]);
    }
}
