//! Id and timestamp utilities shared across Memory Crystal crates.

use std::sync::atomic::{AtomicU64, Ordering};
use chrono::{DateTime, Utc};
use uuid::Uuid;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new monotonic identifier (starts at 1). Used by in-process
/// callers that need a local ordering hint before a store-assigned row id
/// exists (e.g. relay blob correlation in tests).
pub fn next_monotonic_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Current instant as an ISO-8601 UTC timestamp, matching the `created_at`
/// format required by the Chunk, Memory, and source-file data model (§3).
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339()
}

/// Current instant as a `DateTime<Utc>`.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Opaque identifier for dead-drop blobs and relay correlation.
pub fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}
