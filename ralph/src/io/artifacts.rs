//! Per-iteration audit artifacts under `iterations/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::types::{Alert, LoopKind, Outcome, Signal};
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterationMeta {
    pub iteration: u32,
    pub task_id: String,
    pub loop_kind: LoopKind,
    pub outcome: Outcome,
    pub signal: Signal,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
    pub files_touched: Vec<String>,
    pub alerts: Vec<Alert>,
    /// The agent changed the manifest and the controller put it back.
    pub manifest_restored: bool,
    pub sandboxed: bool,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub transcript_path: PathBuf,
    pub verify_log_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, iteration: u32) -> Self {
        let dir = iterations_dir.join(iteration.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            transcript_path: dir.join("transcript.md"),
            verify_log_path: dir.join("verify.log"),
            dir,
        }
    }
}

/// Everything recorded for one iteration.
#[derive(Debug, Clone)]
pub struct IterationArtifacts {
    pub meta: IterationMeta,
    pub transcript: String,
    /// `None` when verification did not run.
    pub verify_log: Option<String>,
}

pub fn write_iteration(iterations_dir: &Path, artifacts: &IterationArtifacts) -> Result<IterationPaths> {
    let paths = IterationPaths::new(iterations_dir, artifacts.meta.iteration);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    // The streamed transcript is replaced by the final capture.
    write_text(&paths.transcript_path, &artifacts.transcript)?;
    if let Some(log) = &artifacts.verify_log {
        write_text(&paths.verify_log_path, log)?;
    }
    write_json_atomic(&paths.meta_path, &artifacts.meta)?;
    Ok(paths)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
