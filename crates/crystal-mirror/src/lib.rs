//! Mirror protocol (spec §4.J): the home node seals and pushes the whole
//! store file; devices pull, integrity-check, and atomically replace their
//! local read-only copy.

#![deny(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crystal_core::relay::{Channel, MirrorDropBody, MirrorMetaPayload};
use crystal_crypto::{CryptoError, Key};
use crystal_relay::{RelayClient, RelayError};

/// Errors from mirror push/pull operations.
#[derive(Debug, Error)]
pub enum MirrorError {
    /// Filesystem failure.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// JSON (de)serialization failure.
    #[error("decode failed: {0}")]
    Serde(#[from] serde_json::Error),
    /// Relay transport failure.
    #[error("relay: {0}")]
    Relay(#[from] RelayError),
    /// Sealed-envelope verification/decryption failed.
    #[error("envelope crypto failed: {0}")]
    Crypto(#[from] CryptoError),
    /// No mirror blob has ever been dropped.
    #[error("no mirror snapshot available")]
    NoMirrorAvailable,
    /// The decrypted store bytes did not hash to the value the sealed
    /// metadata claimed. The existing local mirror is left untouched.
    #[error("mirror integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
}

/// Locally cached pull state (spec §4.J "update local state").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorState {
    /// SHA-256 of the last successfully applied snapshot.
    pub last_applied_hash: String,
    /// When it was applied.
    pub applied_at: DateTime<Utc>,
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a previously saved [`MirrorState`], if any.
pub fn load_state(path: &Path) -> Option<MirrorState> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Persist [`MirrorState`] via a write-then-rename (spec §2.K/§2.L
/// pattern, reused here for the mirror's own small piece of state).
pub fn save_state(path: &Path, state: &MirrorState) -> Result<(), MirrorError> {
    Ok(write_atomic(path, &serde_json::to_vec_pretty(state)?)?)
}

/// Home-node push: read `store_path`'s bytes, seal metadata and the raw
/// bytes under `key`, and drop both on the `mirror` channel (spec §4.J
/// "Home-node push").
pub async fn push(relay: &RelayClient, key: &Key, store_path: &Path) -> Result<String, MirrorError> {
    let db_bytes = std::fs::read(store_path)?;
    let hash = crystal_crypto::hash(&db_bytes);
    let meta = MirrorMetaPayload { hash: hash.clone(), size: db_bytes.len() as u64, pushed_at: Utc::now().to_rfc3339() };

    let sealed_meta = crystal_crypto::seal(&serde_json::to_vec(&meta)?, key);
    let sealed_db = crystal_crypto::seal(&db_bytes, key);
    let body = MirrorDropBody { meta: sealed_meta, db: sealed_db };

    relay.drop_blob(Channel::Mirror, serde_json::to_vec(&body)?).await?;
    tracing::info!(hash = %hash, size = db_bytes.len(), "push: mirror snapshot dropped");
    Ok(hash)
}

/// Outcome of a [`pull`] attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// A newer snapshot was applied; local mirror file replaced.
    Applied { hash: String, size: u64 },
    /// The latest snapshot's hash matches the cached local state; nothing
    /// was written.
    UpToDate { hash: String },
}

/// Device pull: fetch the latest `mirror` blob, verify it, and atomically
/// replace `dest_path` (spec §4.J "Device pull").
pub async fn pull(
    relay: &RelayClient,
    key: &Key,
    dest_path: &Path,
    state_path: &Path,
    force: bool,
) -> Result<PullOutcome, MirrorError> {
    let listing = relay.list_blobs(Channel::Mirror).await?;
    if listing.blobs.is_empty() {
        return Err(MirrorError::NoMirrorAvailable);
    }

    let latest = listing
        .blobs
        .iter()
        .max_by_key(|b| DateTime::parse_from_rfc3339(&b.dropped_at).map(|dt| dt.timestamp()).unwrap_or(i64::MIN))
        .expect("checked non-empty above");

    let raw = relay.fetch_blob(Channel::Mirror, &latest.id).await?;
    let body: MirrorDropBody = serde_json::from_slice(&raw)?;

    let meta_plain = crystal_crypto::open(&body.meta, key)?;
    let meta: MirrorMetaPayload = serde_json::from_slice(&meta_plain)?;

    let cached = load_state(state_path);
    if !force {
        if let Some(cached) = &cached {
            if cached.last_applied_hash == meta.hash {
                tracing::debug!(hash = %meta.hash, "pull: local mirror already up to date, skipping");
                return Ok(PullOutcome::UpToDate { hash: meta.hash });
            }
        }
    }

    let db_plain = crystal_crypto::open(&body.db, key)?;
    let actual_hash = crystal_crypto::hash(&db_plain);
    if actual_hash != meta.hash {
        return Err(MirrorError::IntegrityMismatch { expected: meta.hash, actual: actual_hash });
    }

    atomic_replace(dest_path, &db_plain)?;

    save_state(
        state_path,
        &MirrorState { last_applied_hash: meta.hash.clone(), applied_at: Utc::now() },
    )?;

    for blob in &listing.blobs {
        relay.confirm_blob(Channel::Mirror, &blob.id).await;
    }

    Ok(PullOutcome::Applied { hash: meta.hash, size: meta.size })
}

fn atomic_replace(dest_path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path: PathBuf = dest_path.with_extension("tmp");
    std::fs::write(&tmp_path, bytes)?;
    if dest_path.exists() {
        let bak_path = dest_path.with_extension("bak");
        std::fs::rename(dest_path, bak_path)?;
    }
    std::fs::rename(&tmp_path, dest_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_key() -> Key {
        [3u8; 32]
    }

    #[test]
    fn atomic_replace_backs_up_existing_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("crystal.db");
        std::fs::write(&dest, b"old bytes").unwrap();

        atomic_replace(&dest, b"new bytes").unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"new bytes");
        assert_eq!(std::fs::read(dest.with_extension("bak")).unwrap(), b"old bytes");
    }

    #[test]
    fn atomic_replace_with_no_prior_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("crystal.db");
        atomic_replace(&dest, b"first bytes").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"first bytes");
        assert!(!dest.with_extension("bak").exists());
    }

    #[test]
    fn state_round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror_state.json");
        let state = MirrorState { last_applied_hash: "abc123".to_string(), applied_at: Utc::now() };
        save_state(&path, &state).unwrap();
        let loaded = load_state(&path).unwrap();
        assert_eq!(loaded.last_applied_hash, "abc123");
    }

    #[test]
    fn load_state_returns_none_when_absent_or_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_state(&dir.path().join("missing.json")).is_none());

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, b"not json").unwrap();
        assert!(load_state(&corrupt).is_none());
    }

    #[test]
    fn seal_and_open_round_trip_for_meta_payload() {
        let key = fixed_key();
        let meta = MirrorMetaPayload { hash: "h".to_string(), size: 42, pushed_at: "2026-07-28T00:00:00Z".to_string() };
        let sealed = crystal_crypto::seal(&serde_json::to_vec(&meta).unwrap(), &key);
        let opened = crystal_crypto::open(&sealed, &key).unwrap();
        let back: MirrorMetaPayload = serde_json::from_slice(&opened).unwrap();
        assert_eq!(back.hash, "h");
        assert_eq!(back.size, 42);
    }
}
