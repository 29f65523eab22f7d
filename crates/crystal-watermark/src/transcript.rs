//! Per-transcript incremental capture watermarks (spec §4.K): append-only
//! line-delimited JSON transcripts are re-read incrementally by tracking a
//! byte offset and last-seen timestamp per absolute file path.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from transcript watermark operations.
#[derive(Debug, Error)]
pub enum TranscriptWatermarkError {
    /// Failed to read or seek the transcript file.
    #[error("transcript io: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to persist the watermark state.
    #[error("failed to serialize watermark state: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Recorded progress for a single transcript file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkEntry {
    /// Byte offset of the last-processed tail.
    pub offset: u64,
    /// Timestamp of the last run that touched this entry (ISO-8601 UTC).
    pub last_seen_at: String,
}

type WatermarkMap = HashMap<String, WatermarkEntry>;

/// Handle to the small JSON file holding all tracked transcripts'
/// watermarks, keyed by absolute path.
#[derive(Debug, Clone)]
pub struct TranscriptWatermarkStore {
    path: std::path::PathBuf,
}

impl TranscriptWatermarkStore {
    /// Open (without yet reading) the watermark file at `path`.
    pub fn open(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> WatermarkMap {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save(&self, map: &WatermarkMap) -> Result<(), TranscriptWatermarkError> {
        let body = serde_json::to_vec_pretty(map)?;
        super::write_atomic(&self.path, &body)?;
        Ok(())
    }

    /// Look up the current watermark entry for `transcript_path`, if any.
    pub fn entry(&self, transcript_path: &Path) -> Option<WatermarkEntry> {
        self.load().get(&transcript_path.to_string_lossy().into_owned()).cloned()
    }

    /// Read any new, complete lines appended to `transcript_path` since the
    /// last call, advancing the stored offset to the file's current size.
    ///
    /// On first sight the offset is seeded at the current file size (prior
    /// history is skipped) and no lines are returned.
    pub fn observe_new_lines(
        &self,
        transcript_path: &Path,
    ) -> Result<Vec<String>, TranscriptWatermarkError> {
        let key = transcript_path.to_string_lossy().into_owned();
        let mut map = self.load();
        let metadata = std::fs::metadata(transcript_path)?;
        let size = metadata.len();

        let Some(existing) = map.get(&key).cloned() else {
            map.insert(
                key,
                WatermarkEntry { offset: size, last_seen_at: super::now_iso8601() },
            );
            self.save(&map)?;
            return Ok(Vec::new());
        };

        let offset = existing.offset.min(size);
        let mut file = std::fs::File::open(transcript_path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let text = String::from_utf8_lossy(&buf);
        let ends_with_newline = text.ends_with('\n');
        let mut lines: Vec<String> =
            text.lines().map(str::to_string).filter(|l| !l.trim().is_empty()).collect();
        if !ends_with_newline && !lines.is_empty() {
            // The trailing line has no terminating newline yet: it is an
            // incomplete write from the producer's perspective and is
            // dropped, though the offset still advances past it.
            lines.pop();
        }

        map.insert(key, WatermarkEntry { offset: size, last_seen_at: super::now_iso8601() });
        self.save(&map)?;

        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn first_sight_seeds_offset_and_skips_history() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("t.jsonl");
        std::fs::write(&transcript, "{\"a\":1}\n{\"a\":2}\n").unwrap();
        let store = TranscriptWatermarkStore::open(dir.path().join("watermarks.json"));

        let lines = store.observe_new_lines(&transcript).unwrap();
        assert!(lines.is_empty());
        let entry = store.entry(&transcript).unwrap();
        assert_eq!(entry.offset, std::fs::metadata(&transcript).unwrap().len());
    }

    #[test]
    fn subsequent_run_reads_only_the_new_tail() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("t.jsonl");
        std::fs::write(&transcript, "{\"a\":1}\n").unwrap();
        let store = TranscriptWatermarkStore::open(dir.path().join("watermarks.json"));
        store.observe_new_lines(&transcript).unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(&transcript).unwrap();
        writeln!(f, "{{\"a\":2}}").unwrap();
        writeln!(f, "{{\"a\":3}}").unwrap();

        let lines = store.observe_new_lines(&transcript).unwrap();
        assert_eq!(lines, vec!["{\"a\":2}".to_string(), "{\"a\":3}".to_string()]);
    }

    #[test]
    fn incomplete_trailing_line_is_dropped_but_offset_advances() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("t.jsonl");
        std::fs::write(&transcript, "").unwrap();
        let store = TranscriptWatermarkStore::open(dir.path().join("watermarks.json"));
        store.observe_new_lines(&transcript).unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(&transcript).unwrap();
        write!(f, "{{\"a\":1}}\n{{\"a\":2}}").unwrap(); // no trailing newline

        let lines = store.observe_new_lines(&transcript).unwrap();
        assert_eq!(lines, vec!["{\"a\":1}".to_string()]);

        let entry = store.entry(&transcript).unwrap();
        assert_eq!(entry.offset, std::fs::metadata(&transcript).unwrap().len());

        // A following run sees no new complete lines until the tail closes.
        let lines = store.observe_new_lines(&transcript).unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn corrupt_watermark_file_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let transcript = dir.path().join("t.jsonl");
        std::fs::write(&transcript, "{\"a\":1}\n").unwrap();
        let watermark_path = dir.path().join("watermarks.json");
        std::fs::write(&watermark_path, "not json").unwrap();
        let store = TranscriptWatermarkStore::open(watermark_path);

        let lines = store.observe_new_lines(&transcript).unwrap();
        assert!(lines.is_empty()); // reinitialised as first-sight
    }
}
