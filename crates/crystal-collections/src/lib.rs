//! Source-collection directory indexer (spec §4.G): a hand-rolled
//! recursive directory walk against pre-parsed include/ignore glob sets,
//! SHA-256 change detection against the stored `source_files` table, and
//! batched re-ingestion of changed files.

#![deny(unsafe_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crystal_core::{ChunkInput, Role};
use crystal_embed::Provider;
use crystal_ingest::IngestError;
use crystal_store::{SourceFileChange, Store, StoreError};

/// Files larger than this are treated as data/generated and skipped
/// entirely (spec §4.G).
pub const MAX_FILE_BYTES: u64 = 500 * 1024;

/// Changed files are re-ingested in batches of this many files (spec
/// §4.G "Ingest in batches of 20 files").
pub const FILE_BATCH_SIZE: usize = 20;

/// Errors from collection sync.
#[derive(Debug, Error)]
pub enum CollectionsError {
    /// Storage layer failure.
    #[error("store: {0}")]
    Store(#[from] StoreError),
    /// Directory walk or file read failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Re-ingestion of changed files failed.
    #[error("ingest: {0}")]
    Ingest(#[from] IngestError),
}

/// Pre-parsed include/ignore glob sets, derived once per sync for speed
/// rather than re-parsing glob strings per directory entry (spec §4.G
/// "pre-parsed allow/ignore sets derived from glob lists for speed").
#[derive(Debug, Clone, Default)]
pub struct CollectionFilters {
    include_extensions: HashSet<String>,
    include_basenames: HashSet<String>,
    ignore_dir_names: HashSet<String>,
    ignore_extensions: HashSet<String>,
    ignore_basenames: HashSet<String>,
}

fn split_glob(pattern: &str) -> Option<&str> {
    pattern.strip_prefix("**/")
}

impl CollectionFilters {
    /// Parse `include_globs`/`ignore_globs` into the sets this walker
    /// actually consults. Recognised forms: `**/*<.ext>` (extension),
    /// `**/<name>` (exact basename), and, for ignore lists only,
    /// `**/<name>/**` (directory basename).
    pub fn new(include_globs: &[String], ignore_globs: &[String]) -> Self {
        let mut filters = CollectionFilters::default();

        for pattern in include_globs {
            let Some(rest) = split_glob(pattern) else { continue };
            if let Some(ext) = rest.strip_prefix('*') {
                filters.include_extensions.insert(ext.to_string());
            } else if !rest.contains('*') {
                filters.include_basenames.insert(rest.to_string());
            }
        }

        for pattern in ignore_globs {
            let Some(rest) = split_glob(pattern) else { continue };
            if let Some(dir) = rest.strip_suffix("/**") {
                filters.ignore_dir_names.insert(dir.to_string());
            } else if let Some(ext) = rest.strip_prefix('*') {
                filters.ignore_extensions.insert(ext.to_string());
            } else if !rest.contains('*') {
                filters.ignore_basenames.insert(rest.to_string());
            }
        }

        filters
    }

    fn is_ignored_dir(&self, name: &str) -> bool {
        name.starts_with('.') || self.ignore_dir_names.contains(name)
    }

    fn is_ignored_file(&self, name: &str) -> bool {
        if self.ignore_basenames.contains(name) {
            return true;
        }
        self.ignore_extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    fn is_included_file(&self, name: &str) -> bool {
        if self.include_basenames.contains(name) {
            return true;
        }
        self.include_extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }
}

/// Recursively walk `root`, returning every allowed, non-ignored file path
/// in no particular order.
pub fn walk(root: &Path, filters: &CollectionFilters) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk_dir(root, filters, &mut out)?;
    Ok(out)
}

fn walk_dir(dir: &Path, filters: &CollectionFilters, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if filters.is_ignored_dir(&name) {
                continue;
            }
            walk_dir(&entry.path(), filters, out)?;
        } else if file_type.is_file() {
            if filters.is_ignored_file(&name) {
                continue;
            }
            if filters.is_included_file(&name) {
                out.push(entry.path());
            }
        }
    }
    Ok(())
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "/")
}

/// Counts from a single sync pass (spec §4.G).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Files newly seen this pass.
    pub added: usize,
    /// Files whose content hash changed since the last pass.
    pub updated: usize,
    /// Previously recorded files no longer present on disk.
    pub removed: usize,
    /// Files skipped for exceeding [`MAX_FILE_BYTES`].
    pub skipped_large: usize,
}

struct PendingFile {
    relative: String,
    hash: String,
    size: u64,
    content: String,
}

/// Sync a named collection: walk its root, classify every allowed file
/// against the stored record, and (unless `dry_run`) re-index additions
/// and changes in batches of [`FILE_BATCH_SIZE`] files, then delete
/// records for files no longer present (their chunks remain, per spec §3
/// "Source file"). Dry-run computes the same counts without embedding,
/// ingesting, or touching `source_files`/counters.
pub async fn sync_collection(
    store: &Store,
    embedder: &Provider,
    collection_name: &str,
    root_path: &Path,
    include_globs: &[String],
    ignore_globs: &[String],
    dry_run: bool,
) -> Result<SyncOutcome, CollectionsError> {
    let collection = store.upsert_collection(
        collection_name,
        &root_path.to_string_lossy(),
        include_globs,
        ignore_globs,
    )?;
    let filters = CollectionFilters::new(include_globs, ignore_globs);
    let files_on_disk = walk(root_path, &filters)?;

    let mut outcome = SyncOutcome::default();
    let mut pending = Vec::new();
    let mut seen = HashSet::new();

    for path in &files_on_disk {
        let relative = relative_path(root_path, path);
        seen.insert(relative.clone());

        let metadata = std::fs::metadata(path)?;
        if metadata.len() > MAX_FILE_BYTES {
            outcome.skipped_large += 1;
            continue;
        }
        let Ok(content) = std::fs::read_to_string(path) else {
            tracing::debug!(path = %path.display(), "skipping non-UTF-8 file");
            continue;
        };
        let hash = crystal_crypto::hash(content.as_bytes());

        match store.classify_source_file(collection.id, &relative, &hash)? {
            SourceFileChange::Unchanged => continue,
            SourceFileChange::Added => outcome.added += 1,
            SourceFileChange::Updated => outcome.updated += 1,
            SourceFileChange::Removed => unreachable!("a file present on disk is never classified Removed"),
        }
        pending.push(PendingFile { relative, hash, size: metadata.len(), content });
    }

    if !dry_run {
        for batch in pending.chunks(FILE_BATCH_SIZE) {
            let mut candidates = Vec::new();
            let mut chunk_counts = Vec::with_capacity(batch.len());
            for file in batch {
                let tagged = format!("File: {}\n\n{}", file.relative, file.content);
                let chunks = crystal_chunker::chunk(&tagged);
                chunk_counts.push(chunks.len());
                for text in chunks {
                    candidates.push(ChunkInput {
                        text,
                        role: Role::System,
                        source_type: "file".to_string(),
                        source_id: format!("file:{collection_name}:{}", file.relative),
                        agent_id: "system".to_string(),
                    });
                }
            }
            if !candidates.is_empty() {
                crystal_ingest::ingest_batch(store, embedder, &candidates).await?;
            }
            for (file, chunk_count) in batch.iter().zip(chunk_counts) {
                store.upsert_source_file(
                    collection.id,
                    &file.relative,
                    &file.hash,
                    file.size as i64,
                    chunk_count as i64,
                )?;
            }
        }
    }

    let stored_files = store.list_source_files(collection.id)?;
    for existing in &stored_files {
        if !seen.contains(&existing.relative_path) {
            outcome.removed += 1;
            if !dry_run {
                store.delete_source_file(collection.id, &existing.relative_path)?;
            }
        }
    }

    if !dry_run {
        let stored_files = store.list_source_files(collection.id)?;
        let total_chunks: i64 = stored_files.iter().map(|f| f.chunk_count).sum();
        store.update_collection_counters(collection.id, stored_files.len() as i64, total_chunks)?;
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crystal_store::Store;

    fn filters(include: &[&str], ignore: &[&str]) -> CollectionFilters {
        CollectionFilters::new(
            &include.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &ignore.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
    }

    #[test]
    fn include_matches_by_extension_and_exact_basename() {
        let f = filters(&["**/*.md", "**/README"], &[]);
        assert!(f.is_included_file("notes.md"));
        assert!(f.is_included_file("README"));
        assert!(!f.is_included_file("notes.txt"));
    }

    #[test]
    fn ignore_matches_directories_extensions_and_exact_names() {
        let f = filters(&[], &["**/node_modules/**", "**/*.lock", "**/Cargo.lock"]);
        assert!(f.is_ignored_dir("node_modules"));
        assert!(!f.is_ignored_dir("src"));
        assert!(f.is_ignored_file("yarn.lock"));
        assert!(f.is_ignored_file("Cargo.lock"));
        assert!(!f.is_ignored_file("main.rs"));
    }

    #[test]
    fn hidden_directories_are_always_ignored() {
        let f = filters(&[], &[]);
        assert!(f.is_ignored_dir(".git"));
    }

    #[test]
    fn walk_respects_include_and_ignore_sets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "hello").unwrap();
        std::fs::write(dir.path().join("b.txt"), "skip me, wrong extension").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git").join("config"), "x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("c.md"), "nested").unwrap();

        let f = filters(&["**/*.md"], &[]);
        let mut found = walk(dir.path(), &f).unwrap();
        found.sort();
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|p| p.ends_with("a.md")));
        assert!(found.iter().any(|p| p.ends_with("sub/c.md")));
    }

    #[test]
    fn relative_path_uses_forward_slashes() {
        let root = Path::new("/tmp/docs");
        let path = root.join("a").join("b.md");
        assert_eq!(relative_path(root, &path), "a/b.md");
    }

    #[tokio::test]
    async fn dry_run_computes_counts_without_writing_anything() {
        let store = Store::open_in_memory().unwrap();
        let embedder = Provider::OpenAi(crystal_embed::OpenAiConfig::default());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "hello world").unwrap();

        let outcome = sync_collection(
            &store,
            &embedder,
            "docs",
            dir.path(),
            &["**/*.md".to_string()],
            &[],
            true,
        )
        .await
        .unwrap();

        assert_eq!(outcome.added, 1);
        assert_eq!(store.list_source_files(store.get_collection("docs").unwrap().unwrap().id).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn oversized_files_are_skipped() {
        let store = Store::open_in_memory().unwrap();
        let embedder = Provider::OpenAi(crystal_embed::OpenAiConfig::default());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.md"), "x".repeat((MAX_FILE_BYTES + 1) as usize)).unwrap();

        let outcome = sync_collection(
            &store,
            &embedder,
            "docs",
            dir.path(),
            &["**/*.md".to_string()],
            &[],
            true,
        )
        .await
        .unwrap();

        assert_eq!(outcome.skipped_large, 1);
        assert_eq!(outcome.added, 0);
    }
}
