//! Pathology detection over the trailing progress window.
//!
//! Alerts are advisory. They feed the next instruction context and the failure
//! log but never halt the loop on their own.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::types::{AGENT_TIMEOUT_STEP, Alert, FailureRecord, Outcome, ProgressEntry};
use crate::manifest::Guardrail;

/// Tracker thresholds (`[tracker]` in `config.toml`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Entries (current included) inspected for thrashing.
    pub window: usize,
    pub scope_creep_threshold: usize,
    /// Occurrences after which a failure record becomes a guardrail.
    pub promote_after: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            window: 3,
            scope_creep_threshold: 10,
            promote_after: 3,
        }
    }
}

/// Derive alerts for `entry` given the ledger entries that precede it
/// (oldest first).
///
/// Alerts come back in the order RepeatedTestFailure, Thrashing, ScopeCreep.
pub fn observe(entry: &ProgressEntry, prior: &[ProgressEntry], config: &TrackerConfig) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if let Some(alert) = repeated_failure(entry, prior) {
        alerts.push(alert);
    }
    if let Some(alert) = thrashing(entry, prior, config.window) {
        alerts.push(alert);
    }
    if entry.files_touched.len() > config.scope_creep_threshold {
        alerts.push(Alert::ScopeCreep {
            files_touched: entry.files_touched.len(),
            threshold: config.scope_creep_threshold,
        });
    }

    alerts
}

/// What failed in this entry: the verification step, or the agent call itself.
fn failure_key(entry: &ProgressEntry) -> Option<&str> {
    match (entry.failed_command.as_deref(), entry.outcome) {
        (Some(command), _) => Some(command),
        (None, Outcome::InvocationTimeout) => Some(AGENT_TIMEOUT_STEP),
        _ => None,
    }
}

fn repeated_failure(entry: &ProgressEntry, prior: &[ProgressEntry]) -> Option<Alert> {
    let command = failure_key(entry)?;
    let previous = prior.last()?;
    if previous.task_id != entry.task_id || failure_key(previous) != Some(command) {
        return None;
    }
    Some(Alert::RepeatedTestFailure {
        task_id: entry.task_id.clone(),
        command: command.to_string(),
    })
}

fn thrashing(entry: &ProgressEntry, prior: &[ProgressEntry], window: usize) -> Option<Alert> {
    if window == 0 || prior.len() + 1 < window {
        return None;
    }
    let mut recent: Vec<&ProgressEntry> = prior[prior.len() + 1 - window..].iter().collect();
    recent.push(entry);

    if recent.iter().any(|e| e.outcome == Outcome::Committed) {
        return None;
    }
    let progressed = recent.windows(2).any(|pair| {
        pair[0].task_id != pair[1].task_id
            || pair[1]
                .criteria_satisfied
                .iter()
                .any(|idx| !pair[0].criteria_satisfied.contains(idx))
    });
    if progressed {
        return None;
    }

    let mut common: BTreeSet<&str> = recent[0].files_touched.iter().map(String::as_str).collect();
    for other in &recent[1..] {
        common.retain(|file| other.files_touched.iter().any(|f| f == file));
    }
    if common.is_empty() {
        return None;
    }
    Some(Alert::Thrashing {
        files: common.into_iter().map(str::to_string).collect(),
    })
}

/// Issue key for a failed verification step of a task.
pub fn verification_issue(task_id: &str, command: &str) -> String {
    format!("verification-failed:{task_id}:{command}")
}

/// Issue key for an agent call on a task that hit the iteration timeout.
pub fn invocation_timeout_issue(task_id: &str) -> String {
    format!("invocation-timeout:{task_id}")
}

/// Next version of the failure record for `issue`.
pub fn record_occurrence(
    existing: Option<&FailureRecord>,
    issue: &str,
    iteration: u32,
    root_cause: &str,
) -> FailureRecord {
    match existing {
        Some(record) => FailureRecord {
            occurrences: record.occurrences + 1,
            root_cause: root_cause.to_string(),
            ..record.clone()
        },
        None => FailureRecord {
            issue: issue.to_string(),
            first_seen_iteration: iteration,
            occurrences: 1,
            root_cause: root_cause.to_string(),
            resolution: String::new(),
            promoted_to_guardrail: false,
        },
    }
}

pub fn should_promote(record: &FailureRecord, promote_after: u32) -> bool {
    !record.promoted_to_guardrail && record.occurrences >= promote_after
}

/// Standing instruction distilled from a recurring failure.
pub fn guardrail_for(record: &FailureRecord, iteration: u32) -> Guardrail {
    let (kind, detail) = record
        .issue
        .split_once(':')
        .unwrap_or((record.issue.as_str(), ""));
    let (trigger, instruction) = match kind {
        "thrashing" => (
            format!("about to modify {} again", detail.replace(',', ", ")),
            "Stop and re-read the success criteria. Change approach instead of re-editing the same files."
                .to_string(),
        ),
        "invocation-timeout" => timeout_lesson(detail),
        "repeated-test-failure" | "verification-failed" => {
            let (task_id, command) = detail.rsplit_once(':').unwrap_or((detail, "verification"));
            if command == AGENT_TIMEOUT_STEP {
                timeout_lesson(task_id)
            } else {
                (
                    format!("working on task {task_id} when the '{command}' step fails"),
                    format!(
                        "Run the '{command}' step yourself and read its full output before claiming the task."
                    ),
                )
            }
        }
        "scope-creep" => (
            "a change starts touching many files".to_string(),
            "Keep each iteration to the selected task. Split unrelated edits into their own tasks."
                .to_string(),
        ),
        _ => (
            record.issue.clone(),
            format!("Avoid repeating: {}", record.root_cause),
        ),
    };
    Guardrail {
        name: record.issue.clone(),
        trigger,
        instruction,
        added_after: format!(
            "iteration {iteration} ({} occurrences since iteration {})",
            record.occurrences, record.first_seen_iteration
        ),
    }
}

fn timeout_lesson(task_id: &str) -> (String, String) {
    (
        format!("working on task {task_id}"),
        "Earlier attempts ran out of time. Take a smaller step and finish it well inside the iteration budget."
            .to_string(),
    )
}
