//! Data model shared by the storage, ingestion, and query crates (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role attached to a captured chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// A human/user turn.
    User,
    /// An assistant turn.
    Assistant,
    /// A system-originated chunk (e.g. a mirrored Memory fact).
    System,
}

impl Role {
    /// String form used as the stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Category of an explicit Memory fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// A factual statement.
    Fact,
    /// A stated preference.
    Preference,
    /// A dated event.
    Event,
    /// An opinion.
    Opinion,
    /// A demonstrated skill.
    Skill,
}

impl MemoryCategory {
    /// String form used as the stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::Fact => "fact",
            MemoryCategory::Preference => "preference",
            MemoryCategory::Event => "event",
            MemoryCategory::Opinion => "opinion",
            MemoryCategory::Skill => "skill",
        }
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fact" => Ok(MemoryCategory::Fact),
            "preference" => Ok(MemoryCategory::Preference),
            "event" => Ok(MemoryCategory::Event),
            "opinion" => Ok(MemoryCategory::Opinion),
            "skill" => Ok(MemoryCategory::Skill),
            other => Err(format!("unknown memory category '{other}'")),
        }
    }
}

/// Lifecycle status of a Memory row. Deprecation and deletion are both
/// logical-only; neither physically removes the row or its mirror chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    /// Live and retrievable.
    Active,
    /// Logically retired; the mirror chunk remains searchable.
    Deprecated,
    /// Logically removed.
    Deleted,
}

impl MemoryStatus {
    /// String form used as the stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Active => "active",
            MemoryStatus::Deprecated => "deprecated",
            MemoryStatus::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for MemoryStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MemoryStatus::Active),
            "deprecated" => Ok(MemoryStatus::Deprecated),
            "deleted" => Ok(MemoryStatus::Deleted),
            other => Err(format!("unknown memory status '{other}'")),
        }
    }
}

/// A candidate chunk offered to the ingestion pipeline, before dedup/id
/// assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInput {
    /// Raw chunk text.
    pub text: String,
    /// Speaker role.
    pub role: Role,
    /// Coarse provenance category (`conversation`, `file`, `manual`, ...).
    pub source_type: String,
    /// Free-form origin identifier (transcript path, `memory:{id}`, ...).
    pub source_id: String,
    /// Capturing agent identifier.
    pub agent_id: String,
}

impl ChunkInput {
    /// Rough token estimate at 1 token ≈ 4 characters, matching the
    /// chunker's own approximation (spec §4.C).
    pub fn token_estimate(&self) -> i64 {
        ((self.text.chars().count() as f64) / 4.0).ceil() as i64
    }
}

/// A durable Chunk row as read back from the store (spec §3 "Chunk").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Monotonically assigned store row id.
    pub id: i64,
    /// Raw chunk text.
    pub text: String,
    /// SHA-256 hash of `text`, the store's uniqueness key.
    pub hash: String,
    /// Speaker role.
    pub role: Role,
    /// Coarse provenance category.
    pub source_type: String,
    /// Free-form origin identifier.
    pub source_id: String,
    /// Capturing agent identifier.
    pub agent_id: String,
    /// Rough token estimate recorded at ingest time.
    pub token_estimate: i64,
    /// Creation timestamp (ISO-8601 UTC).
    pub created_at: DateTime<Utc>,
}

/// An explicit Memory fact (spec §3 "Memory").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Store row id.
    pub id: i64,
    /// Memory text.
    pub text: String,
    /// Category.
    pub category: MemoryCategory,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Ids of chunks that originated this memory.
    pub source_chunk_ids: Vec<i64>,
    /// Lifecycle status.
    pub status: MemoryStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// A named source-collection under directory ingestion (spec §3 "Source
/// collection").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCollectionRecord {
    /// Store row id.
    pub id: i64,
    /// Unique collection name.
    pub name: String,
    /// Absolute root path.
    pub root_path: String,
    /// Include glob patterns.
    pub include_globs: Vec<String>,
    /// Ignore glob patterns.
    pub ignore_globs: Vec<String>,
    /// Cached file count.
    pub file_count: i64,
    /// Cached chunk count.
    pub chunk_count: i64,
    /// Last sync timestamp, if ever synced.
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// A single indexed file within a collection (spec §3 "Source file").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFileRecord {
    /// Owning collection id.
    pub collection_id: i64,
    /// Path relative to the collection root.
    pub relative_path: String,
    /// SHA-256 of the file's bytes.
    pub file_hash: String,
    /// File size in bytes.
    pub size_bytes: i64,
    /// Number of chunks produced from this file.
    pub chunk_count: i64,
    /// Last-indexed timestamp.
    pub last_indexed_at: DateTime<Utc>,
}

/// Per-(agent, source) capture progress marker stored in the main store's
/// `capture_state` table (spec §3 "Capture state").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStateRecord {
    /// Capturing agent id.
    pub agent_id: String,
    /// Source/session identifier.
    pub source_id: String,
    /// Last observed message count.
    pub last_message_count: i64,
    /// Cumulative number of capture cycles run.
    pub cycle_count: i64,
    /// Timestamp of the last capture.
    pub last_captured_at: DateTime<Utc>,
}

/// Optional filter applied to hybrid query results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Restrict to a single agent id.
    pub agent_id: Option<String>,
    /// Restrict to a single source type.
    pub source_type: Option<String>,
}

/// Freshness bucket derived from a result's age (spec §4.F step 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessLabel {
    /// Age < 3 days.
    Fresh,
    /// Age < 7 days.
    Recent,
    /// Age < 14 days.
    Aging,
    /// Age >= 14 days.
    Stale,
}

impl FreshnessLabel {
    /// Bucket an age in days per the fixed thresholds 3/7/14.
    pub fn from_age_days(age_days: f64) -> Self {
        if age_days < 3.0 {
            FreshnessLabel::Fresh
        } else if age_days < 7.0 {
            FreshnessLabel::Recent
        } else if age_days < 14.0 {
            FreshnessLabel::Aging
        } else {
            FreshnessLabel::Stale
        }
    }
}

/// A single hybrid-query result record (spec §4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// Chunk text.
    pub text: String,
    /// Speaker role.
    pub role: Role,
    /// Coarse provenance category.
    pub source_type: String,
    /// Free-form origin identifier.
    pub source_id: String,
    /// Capturing agent identifier.
    pub agent_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Final rescaled score in `(0, 1]`.
    pub score: f64,
    /// Freshness bucket.
    pub freshness_label: FreshnessLabel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips() {
        for r in [Role::User, Role::Assistant, Role::System] {
            let s = r.as_str();
            assert_eq!(s.parse::<Role>().unwrap(), r);
        }
    }

    #[test]
    fn freshness_thresholds() {
        assert_eq!(FreshnessLabel::from_age_days(0.0), FreshnessLabel::Fresh);
        assert_eq!(FreshnessLabel::from_age_days(2.999), FreshnessLabel::Fresh);
        assert_eq!(FreshnessLabel::from_age_days(3.0), FreshnessLabel::Recent);
        assert_eq!(FreshnessLabel::from_age_days(6.999), FreshnessLabel::Recent);
        assert_eq!(FreshnessLabel::from_age_days(7.0), FreshnessLabel::Aging);
        assert_eq!(FreshnessLabel::from_age_days(13.999), FreshnessLabel::Aging);
        assert_eq!(FreshnessLabel::from_age_days(14.0), FreshnessLabel::Stale);
    }

    #[test]
    fn token_estimate_rounds_up() {
        let c = ChunkInput {
            text: "abcde".into(),
            role: Role::User,
            source_type: "manual".into(),
            source_id: "x".into(),
            agent_id: "a".into(),
        };
        assert_eq!(c.token_estimate(), 2); // 5 chars / 4 -> ceil(1.25) = 2
    }
}
