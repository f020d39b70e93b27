//! Trace storage backends.
//!
//! The engine talks to storage only through [`TraceStorage`], so hosts can
//! point traces anywhere. The bundled [`FilesystemTraceStore`] lays traces
//! out as `<root>/<project_id>/traces/<name>.jsonl`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::writer::WriteError;

/// Storage backend for per-query trace files.
pub trait TraceStorage: Send + Sync {
    /// Create (or truncate) a trace file for a project and return it open
    /// for writing.
    fn create_trace(&self, project_id: &str, file_name: &str) -> Result<File, WriteError>;

    /// List a project's trace files sorted by name, oldest first.
    fn list_traces(&self, project_id: &str) -> Result<Vec<PathBuf>, WriteError>;

    /// Delete one trace file.
    fn delete_trace(&self, path: &Path) -> Result<(), WriteError>;
}

/// Thread-safe storage reference.
pub type SharedTraceStorage = Arc<dyn TraceStorage>;

/// Filesystem-backed trace storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct FilesystemTraceStore {
    root: PathBuf,
}

impl FilesystemTraceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn traces_dir(&self, project_id: &str) -> Result<PathBuf, WriteError> {
        // Project ids are storage keys, not paths.
        if project_id.contains('/') || project_id.contains('\\') || project_id.contains("..") {
            return Err(WriteError::InvalidProjectId(project_id.to_string()));
        }
        let dir = self.root.join(project_id).join("traces");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl TraceStorage for FilesystemTraceStore {
    fn create_trace(&self, project_id: &str, file_name: &str) -> Result<File, WriteError> {
        let dir = self.traces_dir(project_id)?;
        Ok(File::create(dir.join(file_name))?)
    }

    fn list_traces(&self, project_id: &str) -> Result<Vec<PathBuf>, WriteError> {
        let dir = self.traces_dir(project_id)?;
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
            .collect();
        files.sort();
        Ok(files)
    }

    fn delete_trace(&self, path: &Path) -> Result<(), WriteError> {
        fs::remove_file(path)?;
        Ok(())
    }
}

/// Generate a sortable trace file name: timestamp + short random suffix.
pub fn trace_file_name(trace_id: &str) -> String {
    let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S-%3f");
    let short: String = trace_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("{stamp}_{short}.jsonl")
}

/// Trim a project's trace directory to the most recent `max_count` files.
///
/// Files sort by name (names embed the creation timestamp), so the oldest
/// files are at the front of the listing.
pub fn prune_traces(
    storage: &dyn TraceStorage,
    project_id: &str,
    max_count: usize,
) -> Result<usize, WriteError> {
    let files = storage.list_traces(project_id)?;
    if files.len() <= max_count {
        return Ok(0);
    }
    let excess = files.len() - max_count;
    let mut removed = 0;
    for path in files.iter().take(excess) {
        storage.delete_trace(path)?;
        removed += 1;
    }
    Ok(removed)
}
