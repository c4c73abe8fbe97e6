//! Orchestration for a single loop iteration.
//!
//! `SelectTask -> Invoke -> Verify -> Commit -> Evaluate`. The agent only
//! proposes state changes; this module decides which of them are applied.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::core::error::{LoopError, find_loop_error};
use crate::core::failure_tracker::{
    TrackerConfig, guardrail_for, invocation_timeout_issue, observe, record_occurrence,
    should_promote, verification_issue,
};
use crate::core::selector::next_pending_task;
use crate::core::state_update::{append_guardrail, mark_done};
use crate::core::transcript::{AgentClaims, parse_claims};
use crate::core::types::{
    Alert, FailureRecord, HaltReason, LoopKind, Outcome, ProgressEntry, Signal,
};
use crate::io::agent::{AgentBackend, AgentExit, AgentRequest, InvocationResult, invoke};
use crate::io::artifacts::{IterationArtifacts, IterationMeta};
use crate::io::cancel::CancelToken;
use crate::io::clock::now_rfc3339;
use crate::io::config::{RalphConfig, VerifySettings};
use crate::io::ledger::render_entry;
use crate::io::prompt::{PromptEngine, PromptInputs};
use crate::io::sandbox::Sandbox;
use crate::io::state_store::StateStore;
use crate::io::verify::{VerificationReport, Verifier, run_suite};
use crate::manifest::{Guardrail, Manifest};

/// Configuration for a single iteration.
#[derive(Debug, Clone)]
pub struct StepConfig {
    pub loop_kind: LoopKind,
    /// Target code workspace on the host.
    pub workdir: PathBuf,
    /// Wall-clock budget for the agent call.
    pub iteration_timeout: Duration,
    pub agent_output_limit_bytes: usize,
    pub verify: VerifySettings,
    pub tracker: TrackerConfig,
    /// Ledger entries rendered into the instruction context.
    pub recent_entries: usize,
    /// Iteration budget of the current run, shown to the agent.
    pub max_iterations: u32,
}

impl StepConfig {
    pub fn from_config(cfg: &RalphConfig, loop_kind: LoopKind, workdir: PathBuf, max_iterations: u32) -> Self {
        Self {
            loop_kind,
            workdir,
            iteration_timeout: cfg.iteration_timeout(),
            agent_output_limit_bytes: cfg.agent_output_limit_bytes,
            verify: cfg.verify.clone(),
            tracker: cfg.tracker.clone(),
            recent_entries: cfg.recent_entries,
            max_iterations,
        }
    }
}

/// What one committed iteration did.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    /// Iteration number (1-indexed, continues across runs).
    pub iteration: u32,
    pub task_id: String,
    pub outcome: Outcome,
    pub signal: Signal,
    pub files_touched: Vec<String>,
    pub alerts: Vec<Alert>,
    /// Names of guardrails appended this iteration (agent-proposed or promoted).
    pub guardrails_added: Vec<String>,
    pub manifest_restored: bool,
    /// Iteration-local failure, recorded and not fatal.
    pub error: Option<LoopError>,
    /// Set when this iteration ends the run.
    pub halt: Option<HaltReason>,
}

/// Result of `run_step`.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// No pending task; nothing was invoked.
    Complete,
    Ran(IterationReport),
    /// Interrupted mid-iteration; nothing was committed or recorded.
    Cancelled { iteration: u32, task_id: String },
}

/// Raw material gathered inside the sandbox session.
struct SessionOutput {
    invocation: InvocationResult,
    claims: AgentClaims,
    verification: Option<VerificationReport>,
    sandboxed: bool,
}

/// Execute one iteration of the loop against `store`.
#[instrument(skip_all, fields(loop_kind = config.loop_kind.as_str()))]
pub fn run_step<S, A, V, X>(
    store: &mut S,
    agent: &A,
    verifier: &V,
    sandbox: &X,
    config: &StepConfig,
    cancel: &CancelToken,
) -> Result<StepOutcome>
where
    S: StateStore,
    A: AgentBackend,
    V: Verifier,
    X: Sandbox,
{
    let start = Instant::now();
    let started_at = now_rfc3339();

    let manifest = store.load_manifest()?;
    let Some(task) = next_pending_task(&manifest).cloned() else {
        debug!("no pending task");
        return Ok(StepOutcome::Complete);
    };

    let prior = store.progress_entries()?;
    let iteration = u32::try_from(store.progress_count()?).context("ledger too long")? + 1;
    info!(iteration, task = %task.id, "starting iteration");

    let prior_alerts = match prior.split_last() {
        Some((last, before)) => observe(last, before, &config.tracker),
        None => Vec::new(),
    };
    let recent: String = prior
        .iter()
        .skip(prior.len().saturating_sub(config.recent_entries))
        .map(render_entry)
        .collect();

    let engine = PromptEngine::new()?;
    let manifest_path = store.manifest_path();
    let ledger_path = store.ledger_path();
    let transcript_path = store.transcript_path(iteration);
    let fingerprint_before = store.manifest_fingerprint()?;

    let session_output = sandbox.with_sandbox(|session| {
        // Host paths mean nothing inside a container.
        let host_path = |path: &Option<PathBuf>| {
            path.as_ref()
                .filter(|_| !session.is_isolated())
                .map(|p| p.display().to_string())
        };
        let prompt = engine.render(&PromptInputs {
            loop_kind: config.loop_kind,
            manifest: &manifest,
            task: &task,
            workdir: session.workdir_display(),
            manifest_path: host_path(&manifest_path),
            ledger_path: host_path(&ledger_path),
            alerts: &prior_alerts,
            recent: recent.clone(),
            iteration,
            max_iterations: config.max_iterations,
        })?;

        let deadline = start + config.iteration_timeout;
        let invocation = match remaining_budget(deadline, config.iteration_timeout) {
            Ok(timeout) => {
                let request = AgentRequest {
                    prompt,
                    timeout,
                    output_limit_bytes: config.agent_output_limit_bytes,
                    transcript_path: transcript_path.clone(),
                };
                match invoke(agent, session, &config.workdir, &request, cancel) {
                    Ok(invocation) => invocation,
                    Err(err) if find_loop_error(&err).is_some_and(LoopError::is_fatal) => {
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(err = %format!("{err:#}"), "agent invocation failed");
                        unfinished(format!("agent invocation failed: {err:#}\n"), AgentExit::Failed(None))
                    }
                }
            }
            Err(err) => {
                warn!(err = %err, "iteration budget spent before the agent call");
                unfinished(format!("{err}\n"), AgentExit::TimedOut)
            }
        };

        let claims = if invocation.exit == AgentExit::Finished {
            parse_claims(&invocation.transcript, &task.id, task.success_criteria.len())
        } else {
            AgentClaims::default()
        };

        let verification = if claims.task_done && !cancel.is_cancelled() {
            info!(task = %task.id, "agent claimed completion, verifying");
            Some(run_suite(verifier, session, &manifest.verify, &config.verify, cancel)?)
        } else {
            None
        };

        Ok(SessionOutput {
            invocation,
            claims,
            verification,
            sandboxed: session.is_isolated(),
        })
    })?;

    let manifest_restored = restore_if_tampered(store, &manifest, fingerprint_before.as_deref())?;

    let interrupted = session_output.invocation.exit == AgentExit::Cancelled
        || session_output
            .verification
            .as_ref()
            .is_some_and(VerificationReport::cancelled)
        || cancel.is_cancelled();
    if interrupted {
        warn!(iteration, "iteration cancelled, discarding its outcome");
        return Ok(StepOutcome::Cancelled {
            iteration,
            task_id: task.id,
        });
    }

    let SessionOutput {
        invocation,
        claims,
        verification,
        sandboxed,
    } = session_output;

    let failure = verification.as_ref().and_then(VerificationReport::first_failure);
    let outcome = match (invocation.exit, &verification) {
        (AgentExit::TimedOut, _) => Outcome::InvocationTimeout,
        (AgentExit::Failed(_), _) => Outcome::InvocationFailed,
        (_, None) => Outcome::NoClaim,
        (_, Some(report)) if report.passed() => Outcome::Committed,
        (_, Some(_)) if failure.is_some_and(|f| f.timed_out) => Outcome::VerificationTimeout,
        (_, Some(_)) => Outcome::VerificationFailed,
    };
    let error = invocation
        .error(config.iteration_timeout)
        .or_else(|| failure.and_then(|f| f.error(Duration::from_secs(config.verify.timeout_secs))));
    if let Some(err) = &error {
        warn!(iteration, err = %err, "iteration failed");
    }

    // Commit: the task flips to done only when claimed and verified.
    let mut next = manifest.clone();
    let mut guardrails_added = Vec::new();
    if outcome == Outcome::Committed {
        next = mark_done(next, &task.id)?;
        info!(task = %task.id, "task committed");
    }
    for mut guardrail in claims.guardrails.clone() {
        guardrail.added_after = format!("iteration {iteration} (proposed by agent on task {})", task.id);
        next = add_guardrail(next, guardrail, &mut guardrails_added)?;
    }

    let entry = ProgressEntry {
        iteration,
        task_id: task.id.clone(),
        timestamp: started_at.clone(),
        loop_kind: config.loop_kind,
        outcome,
        signal: invocation.signal,
        files_touched: invocation.files_touched.clone(),
        criteria_satisfied: claims.criteria_met.clone(),
        failed_command: failure.map(|f| f.step.clone()),
        learnings: learnings_for(&claims, &invocation, config.iteration_timeout),
    };
    let alerts = observe(&entry, &prior, &config.tracker);
    for alert in &alerts {
        warn!(iteration, alert = %alert.issue(), "failure tracker alert");
    }

    // Recurrence bookkeeping.
    let mut records = store.failure_records()?;
    let mut occurrences: Vec<(String, String)> = Vec::new();
    if let Some(f) = failure {
        let verdict = if f.timed_out {
            "timed out".to_string()
        } else {
            format!("exited with {:?}", f.exit_code)
        };
        occurrences.push((
            verification_issue(&task.id, &f.step),
            format!("'{}' {verdict}", f.command),
        ));
    }
    if outcome == Outcome::InvocationTimeout {
        occurrences.push((
            invocation_timeout_issue(&task.id),
            format!("agent timed out after {}s", config.iteration_timeout.as_secs()),
        ));
    }
    occurrences.extend(alerts.iter().map(|alert| (alert.issue(), alert.describe())));

    let mut record_versions: Vec<FailureRecord> = Vec::new();
    for (issue, root_cause) in occurrences {
        let existing = records.iter().find(|r| r.issue == issue);
        let mut record = record_occurrence(existing, &issue, iteration, &root_cause);
        if should_promote(&record, config.tracker.promote_after) {
            next = add_guardrail(next, guardrail_for(&record, iteration), &mut guardrails_added)?;
            record.promoted_to_guardrail = true;
            record.resolution = "promoted to guardrail".to_string();
        }
        match records.iter_mut().find(|r| r.issue == issue) {
            Some(slot) => *slot = record.clone(),
            None => records.push(record.clone()),
        }
        record_versions.push(record);
    }

    if next.revision != manifest.revision {
        next.updated = Some(now_rfc3339());
        store.save_manifest(&next)?;
        debug!(revision = next.revision, "manifest saved");
    }
    for record in &record_versions {
        store.append_failure(record)?;
    }
    store.append_progress(&entry)?;

    let halt = if invocation.signal == Signal::Gutter {
        Some(HaltReason::Gutter)
    } else if next_pending_task(&next).is_none() {
        Some(HaltReason::Complete)
    } else {
        None
    };

    store.record_iteration(&IterationArtifacts {
        meta: IterationMeta {
            iteration,
            task_id: task.id.clone(),
            loop_kind: config.loop_kind,
            outcome,
            signal: invocation.signal,
            started_at,
            ended_at: now_rfc3339(),
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            files_touched: invocation.files_touched.clone(),
            alerts: alerts.clone(),
            manifest_restored,
            sandboxed,
        },
        transcript: invocation.transcript.clone(),
        verify_log: verification.as_ref().map(VerificationReport::render_log),
    })?;

    info!(iteration, outcome = outcome.as_str(), halt = ?halt, "iteration finished");
    Ok(StepOutcome::Ran(IterationReport {
        iteration,
        task_id: task.id,
        outcome,
        signal: invocation.signal,
        files_touched: invocation.files_touched,
        alerts,
        guardrails_added,
        manifest_restored,
        error,
        halt,
    }))
}

/// Put the controller's copy back if the agent changed the manifest on disk.
fn restore_if_tampered<S: StateStore>(store: &mut S, manifest: &Manifest, before: Option<&str>) -> Result<bool> {
    let after = store.manifest_fingerprint()?;
    if after.as_deref() == before {
        return Ok(false);
    }
    warn!("manifest changed during agent call, restoring controller copy");
    store.save_manifest(manifest)?;
    Ok(true)
}

fn add_guardrail(manifest: Manifest, guardrail: Guardrail, added: &mut Vec<String>) -> Result<Manifest> {
    let name = guardrail.name.clone();
    match append_guardrail(manifest.clone(), guardrail) {
        Ok(next) => {
            info!(guardrail = %name, "guardrail appended");
            added.push(name);
            Ok(next)
        }
        Err(LoopError::GuardrailExists(_)) => {
            debug!(guardrail = %name, "guardrail already present");
            Ok(manifest)
        }
        Err(err) => Err(err.into()),
    }
}

/// Invocation that produced no usable transcript.
fn unfinished(transcript: String, exit: AgentExit) -> InvocationResult {
    InvocationResult {
        transcript,
        signal: Signal::Continue,
        files_touched: Vec::new(),
        exit,
    }
}

fn learnings_for(claims: &AgentClaims, invocation: &InvocationResult, timeout: Duration) -> String {
    let note = match invocation.exit {
        AgentExit::TimedOut => Some(format!("agent timed out after {}s", timeout.as_secs())),
        AgentExit::Failed(code) => Some(format!("agent exited abnormally (code {code:?})")),
        AgentExit::Finished | AgentExit::Cancelled => None,
    };
    match (note, claims.learnings.is_empty()) {
        (Some(note), true) => note,
        (Some(note), false) => format!("{note}\n{}", claims.learnings),
        (None, _) => claims.learnings.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transcript::{COMPLETE_MARKER, GUTTER_MARKER};
    use crate::manifest::TaskStatus;
    use crate::io::sandbox::NoopSandbox;
    use crate::test_support::{
        FailingSandbox, MemoryStateStore, ScriptedAgent, ScriptedTurn, ScriptedVerifier,
        manifest_with, step_config, task,
    };

    fn two_tasks() -> MemoryStateStore {
        let mut manifest = manifest_with(vec![task("1.1", 1), task("1.2", 2)]);
        manifest.verify.test = Some("cargo test".to_string());
        MemoryStateStore::new(manifest)
    }

    #[test]
    fn claimed_and_verified_task_is_committed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = two_tasks();
        let agent = ScriptedAgent::new(vec![ScriptedTurn::says(format!(
            "<task-done>1.1</task-done><criteria-met>1</criteria-met>{COMPLETE_MARKER}"
        ))]);
        let verifier = ScriptedVerifier::passing();

        let outcome = run_step(
            &mut store,
            &agent,
            &verifier,
            &NoopSandbox::new(temp.path()),
            &step_config(temp.path()),
            &CancelToken::new(),
        )
        .expect("step");

        let StepOutcome::Ran(report) = outcome else {
            panic!("expected an iteration, got {outcome:?}");
        };
        assert_eq!(report.iteration, 1);
        assert_eq!(report.outcome, Outcome::Committed);
        assert_eq!(report.halt, None);
        assert_eq!(store.manifest.task("1.1").expect("task").status, TaskStatus::Done);
        assert_eq!(store.ledger.len(), 1);
        assert_eq!(store.ledger[0].criteria_satisfied, vec![1]);
        assert_eq!(verifier.calls(), vec!["test".to_string()]);
    }

    #[test]
    fn failed_verification_keeps_task_pending_and_records_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = two_tasks();
        let agent = ScriptedAgent::new(vec![ScriptedTurn::says("<task-done>1.1</task-done>")]);
        let verifier = ScriptedVerifier::failing_on("test", 101);

        let outcome = run_step(
            &mut store,
            &agent,
            &verifier,
            &NoopSandbox::new(temp.path()),
            &step_config(temp.path()),
            &CancelToken::new(),
        )
        .expect("step");

        let StepOutcome::Ran(report) = outcome else {
            panic!("expected an iteration");
        };
        assert_eq!(report.outcome, Outcome::VerificationFailed);
        assert_eq!(
            report.error,
            Some(LoopError::VerificationFailed {
                command: "test".to_string(),
                exit_code: Some(101)
            })
        );
        assert!(store.manifest.task("1.1").expect("task").is_pending());
        assert_eq!(store.failures.len(), 1);
        assert_eq!(store.failures[0].issue, "verification-failed:1.1:test");
        assert_eq!(store.ledger[0].failed_command.as_deref(), Some("test"));
    }

    #[test]
    fn no_claim_skips_verification() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = two_tasks();
        let agent = ScriptedAgent::new(vec![ScriptedTurn::says("<task-done>1.2</task-done>")]);
        let verifier = ScriptedVerifier::passing();

        let outcome = run_step(
            &mut store,
            &agent,
            &verifier,
            &NoopSandbox::new(temp.path()),
            &step_config(temp.path()),
            &CancelToken::new(),
        )
        .expect("step");

        let StepOutcome::Ran(report) = outcome else {
            panic!("expected an iteration");
        };
        assert_eq!(report.outcome, Outcome::NoClaim);
        assert!(verifier.calls().is_empty());
        assert_eq!(store.manifest.done_count(), 0);
    }

    #[test]
    fn gutter_halts_after_recording() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = two_tasks();
        let agent = ScriptedAgent::new(vec![ScriptedTurn::says(GUTTER_MARKER)]);

        let outcome = run_step(
            &mut store,
            &agent,
            &ScriptedVerifier::passing(),
            &NoopSandbox::new(temp.path()),
            &step_config(temp.path()),
            &CancelToken::new(),
        )
        .expect("step");

        let StepOutcome::Ran(report) = outcome else {
            panic!("expected an iteration");
        };
        assert_eq!(report.halt, Some(HaltReason::Gutter));
        assert_eq!(report.signal, Signal::Gutter);
        assert_eq!(store.ledger.len(), 1);
    }

    #[test]
    fn timeout_is_recorded_as_iteration_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = two_tasks();
        let agent = ScriptedAgent::new(vec![ScriptedTurn::times_out(COMPLETE_MARKER)]);

        let outcome = run_step(
            &mut store,
            &agent,
            &ScriptedVerifier::passing(),
            &NoopSandbox::new(temp.path()),
            &step_config(temp.path()),
            &CancelToken::new(),
        )
        .expect("step");

        let StepOutcome::Ran(report) = outcome else {
            panic!("expected an iteration");
        };
        assert_eq!(report.outcome, Outcome::InvocationTimeout);
        assert_eq!(report.signal, Signal::Continue);
        assert!(matches!(report.error, Some(LoopError::InvocationTimeout(_))));
        assert!(store.manifest.task("1.1").expect("task").is_pending());
        assert_eq!(store.ledger.len(), 1);
    }

    #[test]
    fn consecutive_timeouts_are_tracked_and_promoted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = two_tasks();
        let turns = (0..4).map(|_| ScriptedTurn::times_out("still working")).collect();
        let agent = ScriptedAgent::new(turns);
        let config = step_config(temp.path());
        let sandbox = NoopSandbox::new(temp.path());
        let verifier = ScriptedVerifier::passing();

        let mut reports = Vec::new();
        for _ in 0..4 {
            let outcome = run_step(&mut store, &agent, &verifier, &sandbox, &config, &CancelToken::new())
                .expect("step");
            let StepOutcome::Ran(report) = outcome else {
                panic!("expected an iteration, got {outcome:?}");
            };
            reports.push(report);
        }

        assert!(reports[0].alerts.is_empty());
        assert!(reports[1].alerts.contains(&Alert::RepeatedTestFailure {
            task_id: "1.1".to_string(),
            command: crate::core::types::AGENT_TIMEOUT_STEP.to_string(),
        }));
        assert!(reports.iter().all(|r| r.halt.is_none()));

        let records = store.failure_records().expect("records");
        let timeouts = records
            .iter()
            .find(|r| r.issue == "invocation-timeout:1.1")
            .expect("timeout record");
        assert_eq!(timeouts.occurrences, 4);
        assert_eq!(timeouts.first_seen_iteration, 1);
        assert!(timeouts.promoted_to_guardrail);
        assert!(
            store
                .manifest
                .guardrails
                .iter()
                .any(|g| g.name == "invocation-timeout:1.1")
        );
        assert!(verifier.calls().is_empty());
    }

    #[test]
    fn verification_timeout_is_recorded_and_loop_continues() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = two_tasks();
        let agent = ScriptedAgent::new(vec![ScriptedTurn::says("<task-done>1.1</task-done>")]);
        let verifier = ScriptedVerifier::timing_out_on("test");
        let config = step_config(temp.path());

        let outcome = run_step(
            &mut store,
            &agent,
            &verifier,
            &NoopSandbox::new(temp.path()),
            &config,
            &CancelToken::new(),
        )
        .expect("step");

        let StepOutcome::Ran(report) = outcome else {
            panic!("expected an iteration");
        };
        assert_eq!(report.outcome, Outcome::VerificationTimeout);
        assert_eq!(
            report.error,
            Some(LoopError::VerificationTimeout {
                command: "test".to_string(),
                timeout: Duration::from_secs(config.verify.timeout_secs),
            })
        );
        assert_eq!(report.halt, None);
        assert!(store.manifest.task("1.1").expect("task").is_pending());
        assert_eq!(store.failures.len(), 1);
        assert_eq!(store.failures[0].issue, "verification-failed:1.1:test");
        assert!(store.failures[0].root_cause.contains("timed out"));
        assert_eq!(store.ledger[0].outcome, Outcome::VerificationTimeout);
    }

    #[test]
    fn spent_budget_is_an_iteration_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = two_tasks();
        let agent = ScriptedAgent::new(Vec::new());
        let mut config = step_config(temp.path());
        config.iteration_timeout = Duration::ZERO;

        let outcome = run_step(
            &mut store,
            &agent,
            &ScriptedVerifier::passing(),
            &NoopSandbox::new(temp.path()),
            &config,
            &CancelToken::new(),
        )
        .expect("step");

        let StepOutcome::Ran(report) = outcome else {
            panic!("expected an iteration");
        };
        assert_eq!(report.outcome, Outcome::InvocationTimeout);
        assert_eq!(report.halt, None);
        assert_eq!(agent.invocations(), 0);
        assert_eq!(store.ledger.len(), 1);
    }

    #[test]
    fn nothing_pending_invokes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut manifest = manifest_with(vec![task("1.1", 1)]);
        manifest.tasks[0].status = TaskStatus::Done;
        let mut store = MemoryStateStore::new(manifest);
        let agent = ScriptedAgent::new(Vec::new());

        let outcome = run_step(
            &mut store,
            &agent,
            &ScriptedVerifier::passing(),
            &NoopSandbox::new(temp.path()),
            &step_config(temp.path()),
            &CancelToken::new(),
        )
        .expect("step");

        assert_eq!(outcome, StepOutcome::Complete);
        assert_eq!(agent.invocations(), 0);
        assert!(store.ledger.is_empty());
    }

    #[test]
    fn cancellation_commits_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = two_tasks();
        let cancel = CancelToken::new();
        let agent = ScriptedAgent::new(vec![
            ScriptedTurn::says(format!("<task-done>1.1</task-done>{COMPLETE_MARKER}"))
                .cancelling(cancel.clone()),
        ]);

        let outcome = run_step(
            &mut store,
            &agent,
            &ScriptedVerifier::passing(),
            &NoopSandbox::new(temp.path()),
            &step_config(temp.path()),
            &cancel,
        )
        .expect("step");

        assert!(matches!(outcome, StepOutcome::Cancelled { iteration: 1, .. }));
        assert!(store.ledger.is_empty());
        assert_eq!(store.manifest.done_count(), 0);
    }

    #[test]
    fn unavailable_sandbox_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = two_tasks();
        let agent = ScriptedAgent::new(vec![ScriptedTurn::says("hi")]);

        let err = run_step(
            &mut store,
            &agent,
            &ScriptedVerifier::passing(),
            &FailingSandbox,
            &step_config(temp.path()),
            &CancelToken::new(),
        )
        .unwrap_err();

        assert!(matches!(
            crate::core::error::find_loop_error(&err),
            Some(LoopError::SandboxUnavailable(_))
        ));
        assert_eq!(agent.invocations(), 0);
        assert!(store.ledger.is_empty());
    }

    #[test]
    fn agent_guardrails_are_appended_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = two_tasks();
        let proposal = r#"<guardrail name="no-sleep" trigger="writing tests">Never sleep in tests.</guardrail>"#;
        let agent = ScriptedAgent::new(vec![
            ScriptedTurn::says(proposal),
            ScriptedTurn::says(proposal),
        ]);
        let config = step_config(temp.path());
        let sandbox = NoopSandbox::new(temp.path());
        let verifier = ScriptedVerifier::passing();

        for _ in 0..2 {
            run_step(&mut store, &agent, &verifier, &sandbox, &config, &CancelToken::new())
                .expect("step");
        }

        assert_eq!(store.manifest.guardrails.len(), 1);
        assert_eq!(store.manifest.guardrails[0].name, "no-sleep");
        assert!(store.manifest.guardrails[0].added_after.contains("iteration 1"));
    }

    #[test]
    fn repeated_failure_is_promoted_to_guardrail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut store = two_tasks();
        let turns = (0..3)
            .map(|_| ScriptedTurn::says("<task-done>1.1</task-done>"))
            .collect();
        let agent = ScriptedAgent::new(turns);
        let verifier = ScriptedVerifier::failing_on("test", 1);
        let config = step_config(temp.path());
        let sandbox = NoopSandbox::new(temp.path());

        let mut last = None;
        for _ in 0..3 {
            last = Some(
                run_step(&mut store, &agent, &verifier, &sandbox, &config, &CancelToken::new())
                    .expect("step"),
            );
        }

        let Some(StepOutcome::Ran(report)) = last else {
            panic!("expected an iteration");
        };
        assert!(report.alerts.iter().any(|a| matches!(a, Alert::RepeatedTestFailure { .. })));
        assert!(
            report
                .guardrails_added
                .contains(&"verification-failed:1.1:test".to_string())
        );
        let promoted = store
            .failures
            .iter()
            .rev()
            .find(|r| r.issue == "verification-failed:1.1:test")
            .expect("record");
        assert_eq!(promoted.occurrences, 3);
        assert!(promoted.promoted_to_guardrail);
    }
}
