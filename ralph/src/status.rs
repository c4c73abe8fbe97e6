//! `ralph status`: read-only summary of a project's committed state.

use std::fmt::Write as _;

use anyhow::Result;

use crate::core::selector::next_pending_task;
use crate::core::types::{FailureRecord, ProgressEntry};
use crate::io::ledger::{self, render_entry};
use crate::io::project::ProjectPaths;
use crate::io::run_state::{RunState, load_run_state};
use crate::io::{failure_log, lock, manifest_store};
use crate::manifest::Manifest;

#[derive(Debug, Clone)]
pub struct ProjectStatus {
    pub name: String,
    pub manifest: Manifest,
    pub run_state: RunState,
    /// Iterations recorded over the project's lifetime.
    pub iterations: usize,
    /// Most recent ledger entries, oldest first.
    pub recent: Vec<ProgressEntry>,
    pub failures: Vec<FailureRecord>,
    /// Live process holding the run lock.
    pub lock_holder: Option<u32>,
}

pub fn collect_status(paths: &ProjectPaths, recent: usize) -> Result<ProjectStatus> {
    let manifest = manifest_store::load_manifest(&paths.manifest_path)?;
    let run_state = load_run_state(&paths.run_state_path)?;
    let entries = ledger::read_entries(&paths.progress_path)?;
    let iterations = ledger::entry_count(&paths.progress_path)?;
    let failures = failure_log::latest_records(&paths.failures_path)?;
    let lock_holder = lock::holder(&paths.lock_path)?;
    let skip = entries.len().saturating_sub(recent);
    Ok(ProjectStatus {
        name: paths.name.clone(),
        manifest,
        run_state,
        iterations,
        recent: entries.into_iter().skip(skip).collect(),
        failures,
        lock_holder,
    })
}

pub fn render_status(status: &ProjectStatus) -> String {
    let manifest = &status.manifest;
    let mut out = String::new();
    let _ = writeln!(out, "project: {}", status.name);
    let _ = writeln!(
        out,
        "tasks: {}/{} done",
        manifest.done_count(),
        manifest.tasks.len()
    );
    match next_pending_task(manifest) {
        Some(task) => {
            let _ = writeln!(out, "next: {} {} (priority {})", task.id, task.name, task.priority);
        }
        None => out.push_str("next: none, all tasks done\n"),
    }
    let _ = writeln!(out, "iterations: {}", status.iterations);
    let _ = writeln!(out, "guardrails: {}", manifest.guardrails.len());

    let state = &status.run_state;
    match status.lock_holder {
        Some(pid) => {
            let _ = writeln!(out, "run: active (pid {pid})");
        }
        None if state.active => out.push_str("run: interrupted, no process holds the lock\n"),
        None => {}
    }
    if let Some(halt) = state.last_halt {
        let _ = writeln!(out, "last halt: {halt} after {} iteration(s)", state.iterations_run);
    }

    let open: Vec<&FailureRecord> = status
        .failures
        .iter()
        .filter(|r| !r.promoted_to_guardrail)
        .collect();
    if !open.is_empty() {
        out.push_str("\nrecurring failures:\n");
        for record in open {
            let _ = writeln!(out, "- {} x{}: {}", record.issue, record.occurrences, record.root_cause);
        }
    }

    if !status.recent.is_empty() {
        out.push('\n');
        for entry in &status.recent {
            out.push_str(&render_entry(entry));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{HaltReason, Outcome};
    use crate::io::ledger::append_entry;
    use crate::io::run_state::write_run_state;
    use crate::test_support::{TestProject, done_task, manifest_with, progress_entry, task};

    #[test]
    fn fresh_project_reports_next_task() {
        let project =
            TestProject::new(&manifest_with(vec![done_task("1.1", 1), task("1.2", 2)])).expect("project");

        let status = collect_status(&project.paths, 3).expect("status");
        let text = render_status(&status);

        assert!(text.contains("tasks: 1/2 done"));
        assert!(text.contains("next: 1.2 1.2 name (priority 2)"));
        assert!(text.contains("iterations: 0"));
        assert!(!text.contains("last halt"));
    }

    #[test]
    fn shows_recent_entries_and_last_halt() {
        let project = TestProject::new(&manifest_with(vec![task("1.1", 1)])).expect("project");
        for iteration in 1..=4 {
            append_entry(
                &project.paths.progress_path,
                &progress_entry(iteration, "1.1", Outcome::NoClaim),
            )
            .expect("append");
        }
        write_run_state(
            &project.paths.run_state_path,
            &RunState {
                last_halt: Some(HaltReason::MaxIterationsReached),
                iterations_run: 4,
                ..RunState::default()
            },
        )
        .expect("run state");

        let status = collect_status(&project.paths, 2).expect("status");
        let iterations: Vec<u32> = status.recent.iter().map(|e| e.iteration).collect();
        assert_eq!(iterations, vec![3, 4]);

        let text = render_status(&status);
        assert!(text.contains("last halt: max_iterations_reached after 4 iteration(s)"));
        assert!(text.contains("## Iteration 4 | task `1.1` | "));
    }

    #[test]
    fn active_flag_without_live_lock_reads_as_interrupted() {
        let project = TestProject::new(&manifest_with(vec![task("1.1", 1)])).expect("project");
        write_run_state(
            &project.paths.run_state_path,
            &RunState {
                active: true,
                ..RunState::default()
            },
        )
        .expect("run state");

        let text = render_status(&collect_status(&project.paths, 3).expect("status"));
        assert!(text.contains("run: interrupted"));

        std::fs::write(&project.paths.lock_path, format!("{}\n", std::process::id())).expect("lock");
        let text = render_status(&collect_status(&project.paths, 3).expect("status"));
        assert!(text.contains(&format!("run: active (pid {})", std::process::id())));
    }
}
