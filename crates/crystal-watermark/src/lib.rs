//! Process-wide small-file state for Memory Crystal: the private-mode gate
//! (spec §4.L) and per-transcript incremental capture watermarks (spec
//! §4.K). Both are single small JSON files, written via a temp-file-then-
//! rename sequence so a crash never leaves a half-written state file.

#![deny(unsafe_code)]

pub mod private_mode;
pub mod transcript;

pub use private_mode::{is_enabled, set_enabled, PrivateModeError};
pub use transcript::{TranscriptWatermarkError, TranscriptWatermarkStore, WatermarkEntry};

/// Default minimum aggregate estimated tokens a batch of newly observed
/// transcript lines must reach before it is worth capturing.
pub const DEFAULT_MIN_CAPTURE_TOKENS: i64 = 500;

/// `1 token ≈ 4 characters`, rounded up; shared with `crystal-chunker`'s
/// convention.
pub fn estimate_tokens(text: &str) -> i64 {
    ((text.chars().count() as f64) / 4.0).ceil() as i64
}

/// Current UTC time, RFC 3339-formatted.
fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Write `contents` to `path` atomically: write to a sibling `.tmp` file,
/// fsync it, then rename over the destination.
fn write_atomic(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        std::io::Write::write_all(&mut f, contents)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Whether an aggregate batch of newly observed lines clears the
/// minimum-tokens gate and is worth capturing at all.
pub fn clears_capture_gate(lines: &[String], min_tokens: i64) -> bool {
    lines.iter().map(|l| estimate_tokens(l)).sum::<i64>() >= min_tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_matches_chunker_convention() {
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
    }

    #[test]
    fn capture_gate_suppresses_trivial_batches() {
        let tiny = vec!["hi".to_string()];
        assert!(!clears_capture_gate(&tiny, DEFAULT_MIN_CAPTURE_TOKENS));

        let big = vec!["x".repeat(4000)];
        assert!(clears_capture_gate(&big, DEFAULT_MIN_CAPTURE_TOKENS));
    }
}
