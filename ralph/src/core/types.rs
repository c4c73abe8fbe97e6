//! Shared deterministic types for the loop core.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Terminal token extracted from an agent transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// No marker present.
    Continue,
    Complete,
    Gutter,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Continue => "continue",
            Signal::Complete => "complete",
            Signal::Gutter => "gutter",
        }
    }
}

/// Classification of one iteration, recorded in the progress ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Claimed, verified and marked done.
    Committed,
    VerificationFailed,
    VerificationTimeout,
    /// The agent worked but did not claim the selected task.
    NoClaim,
    InvocationTimeout,
    InvocationFailed,
}

impl Outcome {
    pub const ALL: [Outcome; 6] = [
        Outcome::Committed,
        Outcome::VerificationFailed,
        Outcome::VerificationTimeout,
        Outcome::NoClaim,
        Outcome::InvocationTimeout,
        Outcome::InvocationFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Committed => "committed",
            Outcome::VerificationFailed => "verification_failed",
            Outcome::VerificationTimeout => "verification_timeout",
            Outcome::NoClaim => "no_claim",
            Outcome::InvocationTimeout => "invocation_timeout",
            Outcome::InvocationFailed => "invocation_failed",
        }
    }
}

impl FromStr for Outcome {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Outcome::ALL
            .into_iter()
            .find(|outcome| outcome.as_str() == s)
            .ok_or_else(|| anyhow!("unknown outcome '{s}'"))
    }
}

/// Instruction template family. Every kind shares the same controller contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LoopKind {
    Default,
    TestCoverage,
    Linting,
    Duplication,
    Entropy,
}

impl LoopKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopKind::Default => "default",
            LoopKind::TestCoverage => "test-coverage",
            LoopKind::Linting => "linting",
            LoopKind::Duplication => "duplication",
            LoopKind::Entropy => "entropy",
        }
    }
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append to the progress ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    /// Iteration number (1-indexed, counted over the project's lifetime).
    pub iteration: u32,
    pub task_id: String,
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    pub loop_kind: LoopKind,
    pub outcome: Outcome,
    pub signal: Signal,
    /// Workspace-relative paths, sorted.
    pub files_touched: Vec<String>,
    /// 1-based indices into the task's success criteria, sorted.
    pub criteria_satisfied: Vec<usize>,
    /// Verification step that failed (`lint`, `test` or `build`).
    pub failed_command: Option<String>,
    pub learnings: String,
}

/// Pseudo step name for agent calls that hit the iteration timeout.
pub const AGENT_TIMEOUT_STEP: &str = "agent-timeout";

/// Advisory signal raised by the failure tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    Thrashing { files: Vec<String> },
    RepeatedTestFailure { task_id: String, command: String },
    ScopeCreep { files_touched: usize, threshold: usize },
}

impl Alert {
    /// Stable issue key used for failure records.
    pub fn issue(&self) -> String {
        match self {
            Alert::Thrashing { files } => format!("thrashing:{}", files.join(",")),
            Alert::RepeatedTestFailure { task_id, command } => {
                format!("repeated-test-failure:{task_id}:{command}")
            }
            Alert::ScopeCreep { .. } => "scope-creep".to_string(),
        }
    }

    /// Human-readable line injected into the next agent instruction context.
    pub fn describe(&self) -> String {
        match self {
            Alert::Thrashing { files } => format!(
                "Thrashing: {} modified in each of the last iterations without new success criteria being met",
                files.join(", ")
            ),
            Alert::RepeatedTestFailure { task_id, command } if command == AGENT_TIMEOUT_STEP => format!(
                "Repeated failure: the agent timed out in consecutive iterations of task {task_id}"
            ),
            Alert::RepeatedTestFailure { task_id, command } => format!(
                "Repeated failure: verification step '{command}' failed in consecutive iterations of task {task_id}"
            ),
            Alert::ScopeCreep {
                files_touched,
                threshold,
            } => format!(
                "Scope creep: last iteration touched {files_touched} files (threshold {threshold})"
            ),
        }
    }
}

/// Recurring issue tracked in the append-only failure log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub issue: String,
    pub first_seen_iteration: u32,
    pub occurrences: u32,
    pub root_cause: String,
    pub resolution: String,
    pub promoted_to_guardrail: bool,
}

/// Why a loop run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// No pending task remains.
    Complete,
    /// The agent emitted the GUTTER marker.
    Gutter,
    MaxIterationsReached,
    /// Operator stop.
    Cancelled,
}

impl HaltReason {
    pub fn as_str(self) -> &'static str {
        match self {
            HaltReason::Complete => "complete",
            HaltReason::Gutter => "gutter",
            HaltReason::MaxIterationsReached => "max_iterations_reached",
            HaltReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_names_parse_back() {
        for outcome in Outcome::ALL {
            assert_eq!(outcome.as_str().parse::<Outcome>().expect("parse"), outcome);
        }
        assert!("exploded".parse::<Outcome>().is_err());
    }

    #[test]
    fn alert_issue_keys_are_stable() {
        let alert = Alert::RepeatedTestFailure {
            task_id: "1.2".to_string(),
            command: "test".to_string(),
        };
        assert_eq!(alert.issue(), "repeated-test-failure:1.2:test");
        let thrash = Alert::Thrashing {
            files: vec!["src/a.rs".to_string(), "src/b.rs".to_string()],
        };
        assert_eq!(thrash.issue(), "thrashing:src/a.rs,src/b.rs");
    }

    #[test]
    fn loop_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&LoopKind::TestCoverage).expect("serialize");
        assert_eq!(json, "\"test-coverage\"");
    }
}
