//! Private-mode gate (spec §4.L): a single flag persisted to a small JSON
//! file. Absence or corruption both mean "enabled" — capture paths fail
//! open so that missing configuration never silently suppresses capture.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from private-mode gate operations. Reading never returns one —
/// any I/O or parse failure is treated as "enabled" instead.
#[derive(Debug, Error)]
pub enum PrivateModeError {
    /// Failed to persist the new state.
    #[error("failed to write private-mode state: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to serialize the new state.
    #[error("failed to serialize private-mode state: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct PrivateModeState {
    enabled: bool,
}

/// Is capture/explicit-write currently enabled? Defaults to `true` when the
/// file is absent, unreadable, or does not parse.
pub fn is_enabled(path: &Path) -> bool {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return true;
    };
    match serde_json::from_str::<PrivateModeState>(&raw) {
        Ok(state) => state.enabled,
        Err(_) => true,
    }
}

/// Persist the private-mode flag.
pub fn set_enabled(path: &Path, enabled: bool) -> Result<(), PrivateModeError> {
    let state = PrivateModeState { enabled };
    let body = serde_json::to_vec_pretty(&state)?;
    super::write_atomic(path, &body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_file_defaults_to_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private_mode.json");
        assert!(is_enabled(&path));
    }

    #[test]
    fn corrupt_file_defaults_to_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private_mode.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(is_enabled(&path));
    }

    #[test]
    fn explicit_false_disables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private_mode.json");
        set_enabled(&path, false).unwrap();
        assert!(!is_enabled(&path));
    }

    #[test]
    fn round_trips_through_set_and_is_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("private_mode.json");
        set_enabled(&path, false).unwrap();
        set_enabled(&path, true).unwrap();
        assert!(is_enabled(&path));
    }
}
