//! Bookkeeping for the most recent run (`run_state.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{HaltReason, LoopKind};
use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunState {
    /// True while a loop is running; cleared on every halt.
    pub active: bool,
    pub loop_kind: Option<LoopKind>,
    /// Iterations executed by the most recent run.
    pub iterations_run: u32,
    pub last_halt: Option<HaltReason>,
    pub started_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Load run state; a missing file yields the default.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(RunState::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("read run state {}", path.display()));
        }
    };
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), active = state.active, last_halt = ?state.last_halt, "writing run state");
    write_json_atomic(path, state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run_state.json");

        let state = RunState {
            active: false,
            loop_kind: Some(LoopKind::Linting),
            iterations_run: 4,
            last_halt: Some(HaltReason::Gutter),
            started_at: Some("2026-01-01T00:00:00Z".to_string()),
            updated_at: Some("2026-01-01T00:10:00Z".to_string()),
        };

        write_run_state(&path, &state).expect("write");
        assert_eq!(load_run_state(&path).expect("load"), state);
    }

    #[test]
    fn missing_file_is_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = load_run_state(&temp.path().join("run_state.json")).expect("load");
        assert_eq!(state, RunState::default());
    }
}
