//! Filesystem searcher — the file-search collaborator.
//!
//! Walks the requested roots with `walkdir` (no symlink following, bounded
//! depth) and matches file names against a case-insensitive glob. Each root
//! is walked in sorted order, so a root's walk stops as soon as it has
//! produced `max_results` matches. Results are sorted so repeated searches
//! return the same order.

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use merlin_core::collaborator::{FileSearcher, SearchQuery};
use merlin_core::error::ToolError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use walkdir::WalkDir;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Searches the local filesystem.
#[derive(Debug, Clone)]
pub struct FsSearcher {
    /// Files above this size are skipped by content filters
    max_content_bytes: u64,
}

impl Default for FsSearcher {
    fn default() -> Self {
        Self::new(1024 * 1024)
    }
}

impl FsSearcher {
    pub fn new(max_content_bytes: u64) -> Self {
        Self { max_content_bytes }
    }

    /// Walk the roots on the calling thread. The walk stops early once
    /// `cancelled` is set.
    fn search_blocking(&self, query: &SearchQuery, cancelled: &AtomicBool) -> Result<Vec<PathBuf>, ToolError> {
        let pattern = Pattern::new(&query.pattern).map_err(|e| ToolError::SchemaViolation {
            tool_name: "search_files".into(),
            reason: format!("invalid pattern '{}': {e}", query.pattern),
        })?;
        let needle = query.contains.as_ref().map(|c| c.to_lowercase());
        let match_path = query.pattern.contains('/');

        let mut found = Vec::new();
        for root in &query.roots {
            if !root.is_dir() {
                debug!(root = %root.display(), "Skipping missing search root");
                continue;
            }
            // Pre-order over sorted names visits paths in `Path` order, so
            // the first `max_results` matches of a root are its smallest.
            let walker = WalkDir::new(root)
                .follow_links(false)
                .max_depth(query.max_depth.max(1))
                .sort_by_file_name()
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file());

            let mut from_root = 0usize;
            for entry in walker {
                if cancelled.load(Ordering::Relaxed) {
                    debug!(root = %root.display(), "Search cancelled");
                    return Ok(Vec::new());
                }
                if from_root >= query.max_results {
                    break;
                }
                let path = entry.path();
                let candidate = if match_path {
                    path.strip_prefix(root).unwrap_or(path).to_string_lossy().to_string()
                } else {
                    entry.file_name().to_string_lossy().to_string()
                };
                if !pattern.matches_with(&candidate, MATCH_OPTIONS) {
                    continue;
                }
                if let Some(needle) = &needle
                    && !self.content_contains(path, needle)
                {
                    continue;
                }
                found.push(path.to_path_buf());
                from_root += 1;
            }
        }

        found.sort();
        found.dedup();
        found.truncate(query.max_results);
        Ok(found)
    }

    fn content_contains(&self, path: &Path, needle: &str) -> bool {
        let Ok(meta) = path.metadata() else {
            return false;
        };
        if meta.len() > self.max_content_bytes {
            return false;
        }
        let mut buf = Vec::new();
        match std::fs::File::open(path).and_then(|mut f| f.read_to_end(&mut buf)) {
            Ok(_) => String::from_utf8_lossy(&buf).to_lowercase().contains(needle),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl FileSearcher for FsSearcher {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<PathBuf>, ToolError> {
        let searcher = self.clone();
        let query = query.clone();
        let cancel = CancelOnDrop::default();
        let cancelled = cancel.0.clone();
        let result = tokio::task::spawn_blocking(move || searcher.search_blocking(&query, &cancelled)).await;
        drop(cancel);
        result
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: "search_files".into(),
                reason: format!("search task failed: {e}"),
            })?
    }
}

/// Raises the shared flag when the owning future is dropped, so a timed-out
/// step also stops its blocking walk.
#[derive(Default)]
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}
