//! Signal and claim extraction from agent transcripts.
//!
//! The transcript is untrusted. Only the two `<promise>` markers carry halt
//! authority; the claim tags are proposals the controller checks before acting.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::Signal;
use crate::manifest::Guardrail;

pub const COMPLETE_MARKER: &str = "<promise>COMPLETE</promise>";
pub const GUTTER_MARKER: &str = "<promise>GUTTER</promise>";

/// Strict literal scan for the terminal markers. GUTTER wins over COMPLETE.
pub fn extract_signal(transcript: &str) -> Signal {
    if transcript.contains(GUTTER_MARKER) {
        Signal::Gutter
    } else if transcript.contains(COMPLETE_MARKER) {
        Signal::Complete
    } else {
        Signal::Continue
    }
}

/// State changes proposed by the agent for the selected task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentClaims {
    /// The agent claims the selected task is done.
    pub task_done: bool,
    /// 1-based success criteria indices, sorted and deduplicated.
    pub criteria_met: Vec<usize>,
    pub learnings: String,
    pub guardrails: Vec<Guardrail>,
}

static TASK_DONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<task-done>([^<]+)</task-done>").expect("task-done pattern should be valid")
});
static CRITERIA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<criteria-met>([^<]*)</criteria-met>").expect("criteria pattern should be valid")
});
static LEARNINGS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<learnings>(.*?)</learnings>").expect("learnings pattern should be valid")
});
static GUARDRAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<guardrail\s+name="([^"]+)"\s+trigger="([^"]+)"\s*>(.*?)</guardrail>"#)
        .expect("guardrail pattern should be valid")
});

/// Parse claim tags for `task_id`.
///
/// `<task-done>` for any other id is ignored. A COMPLETE signal counts as a
/// completion claim for the selected task. `criteria_count` bounds the
/// accepted criteria indices.
pub fn parse_claims(transcript: &str, task_id: &str, criteria_count: usize) -> AgentClaims {
    let signal = extract_signal(transcript);
    let task_done = signal == Signal::Complete
        || TASK_DONE_RE
            .captures_iter(transcript)
            .any(|caps| caps[1].trim() == task_id);

    let criteria_met: BTreeSet<usize> = CRITERIA_RE
        .captures_iter(transcript)
        .flat_map(|caps| {
            caps[1]
                .split(',')
                .filter_map(|part| part.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|idx| *idx >= 1 && *idx <= criteria_count)
        .collect();

    let learnings = LEARNINGS_RE
        .captures_iter(transcript)
        .map(|caps| caps[1].trim().to_string())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let guardrails = GUARDRAIL_RE
        .captures_iter(transcript)
        .filter_map(|caps| {
            let instruction = caps[3].trim();
            if instruction.is_empty() {
                return None;
            }
            Some(Guardrail {
                name: caps[1].trim().to_string(),
                trigger: caps[2].trim().to_string(),
                instruction: instruction.to_string(),
                added_after: String::new(),
            })
        })
        .collect();

    AgentClaims {
        task_done,
        criteria_met: criteria_met.into_iter().collect(),
        learnings,
        guardrails,
    }
}
