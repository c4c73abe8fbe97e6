//! Persistent controller state behind one seam.
//!
//! The step orchestration only talks to a [`StateStore`], so the state machine
//! can be driven against [`FileStateStore`] in production and an in-memory
//! store in tests.

use std::path::PathBuf;

use anyhow::Result;

use crate::core::types::{FailureRecord, ProgressEntry};
use crate::io::artifacts::{IterationArtifacts, write_iteration};
use crate::io::project::ProjectPaths;
use crate::io::{failure_log, ledger, manifest_store};
use crate::manifest::Manifest;

pub trait StateStore {
    fn load_manifest(&self) -> Result<Manifest>;
    /// Persist atomically.
    fn save_manifest(&mut self, manifest: &Manifest) -> Result<()>;
    /// Content fingerprint of the persisted manifest, `None` if missing.
    fn manifest_fingerprint(&self) -> Result<Option<String>>;

    fn append_progress(&mut self, entry: &ProgressEntry) -> Result<()>;
    /// Ledger entries the tracker can read back, oldest first.
    fn progress_entries(&self) -> Result<Vec<ProgressEntry>>;
    /// Number of iterations recorded in the ledger.
    fn progress_count(&self) -> Result<usize>;

    fn append_failure(&mut self, record: &FailureRecord) -> Result<()>;
    /// Latest version of each failure record.
    fn failure_records(&self) -> Result<Vec<FailureRecord>>;

    fn record_iteration(&mut self, artifacts: &IterationArtifacts) -> Result<()>;

    /// Host paths the agent may read for reference, if any.
    fn manifest_path(&self) -> Option<PathBuf> {
        None
    }
    fn ledger_path(&self) -> Option<PathBuf> {
        None
    }
    /// Where the live transcript of `iteration` is streamed.
    fn transcript_path(&self, _iteration: u32) -> Option<PathBuf> {
        None
    }
}

/// State files of one project directory.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    paths: ProjectPaths,
}

impl FileStateStore {
    pub fn new(paths: ProjectPaths) -> Self {
        Self { paths }
    }
}

impl StateStore for FileStateStore {
    fn load_manifest(&self) -> Result<Manifest> {
        manifest_store::load_manifest(&self.paths.manifest_path)
    }

    fn save_manifest(&mut self, manifest: &Manifest) -> Result<()> {
        manifest_store::write_manifest(&self.paths.manifest_path, manifest)
    }

    fn manifest_fingerprint(&self) -> Result<Option<String>> {
        manifest_store::fingerprint_file(&self.paths.manifest_path)
    }

    fn append_progress(&mut self, entry: &ProgressEntry) -> Result<()> {
        ledger::append_entry(&self.paths.progress_path, entry)
    }

    fn progress_entries(&self) -> Result<Vec<ProgressEntry>> {
        ledger::read_entries(&self.paths.progress_path)
    }

    fn progress_count(&self) -> Result<usize> {
        ledger::entry_count(&self.paths.progress_path)
    }

    fn append_failure(&mut self, record: &FailureRecord) -> Result<()> {
        failure_log::append_record(&self.paths.failures_path, record)
    }

    fn failure_records(&self) -> Result<Vec<FailureRecord>> {
        failure_log::latest_records(&self.paths.failures_path)
    }

    fn record_iteration(&mut self, artifacts: &IterationArtifacts) -> Result<()> {
        write_iteration(&self.paths.iterations_dir, artifacts)?;
        Ok(())
    }

    fn manifest_path(&self) -> Option<PathBuf> {
        Some(self.paths.manifest_path.clone())
    }

    fn ledger_path(&self) -> Option<PathBuf> {
        Some(self.paths.progress_path.clone())
    }

    fn transcript_path(&self, iteration: u32) -> Option<PathBuf> {
        Some(
            self.paths
                .iterations_dir
                .join(iteration.to_string())
                .join("transcript.md"),
        )
    }
}
