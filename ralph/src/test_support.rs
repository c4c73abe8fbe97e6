//! Test-only builders and scripted seams for driving the loop without
//! spawning agents or touching a container runtime.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::core::error::LoopError;
use crate::core::failure_tracker::TrackerConfig;
use crate::core::types::{FailureRecord, LoopKind, Outcome, ProgressEntry, Signal};
use crate::io::agent::{AgentBackend, AgentExit, AgentRequest, AgentRun};
use crate::io::artifacts::IterationArtifacts;
use crate::io::cancel::CancelToken;
use crate::io::config::VerifySettings;
use crate::io::failure_log::collapse;
use crate::io::manifest_store::fingerprint;
use crate::io::project::{InitOptions, ProjectPaths, RalphHome, init_project};
use crate::io::sandbox::{Sandbox, SandboxSession};
use crate::io::state_store::StateStore;
use crate::io::verify::{VerificationResult, Verifier};
use crate::manifest::{Guardrail, Manifest, Task, TaskStatus, VerifyConfig};
use crate::step::StepConfig;

/// Create a deterministic pending task with one success criterion.
pub fn task(id: &str, priority: i64) -> Task {
    Task {
        id: id.to_string(),
        name: format!("{id} name"),
        description: format!("{id} description"),
        status: TaskStatus::Pending,
        priority,
        success_criteria: vec![format!("{id} works")],
        notes: None,
    }
}

pub fn done_task(id: &str, priority: i64) -> Task {
    Task {
        status: TaskStatus::Done,
        ..task(id, priority)
    }
}

pub fn manifest_with(tasks: Vec<Task>) -> Manifest {
    Manifest {
        name: "demo".to_string(),
        max_iterations: 20,
        verify: VerifyConfig::default(),
        tasks,
        guardrails: Vec::new(),
        revision: 0,
        created: None,
        updated: None,
    }
}

pub fn guardrail(name: &str, trigger: &str) -> Guardrail {
    Guardrail {
        name: name.to_string(),
        trigger: trigger.to_string(),
        instruction: format!("{name} instruction"),
        added_after: String::new(),
    }
}

/// Ledger entry with empty footprint and no claims.
pub fn progress_entry(iteration: u32, task_id: &str, outcome: Outcome) -> ProgressEntry {
    ProgressEntry {
        iteration,
        task_id: task_id.to_string(),
        timestamp: "2026-01-01T00:00:00Z".to_string(),
        loop_kind: LoopKind::Default,
        outcome,
        signal: Signal::Continue,
        files_touched: Vec::new(),
        criteria_satisfied: Vec::new(),
        failed_command: None,
        learnings: String::new(),
    }
}

/// Step configuration with generous timeouts for `workdir`.
pub fn step_config(workdir: &Path) -> StepConfig {
    StepConfig {
        loop_kind: LoopKind::Default,
        workdir: workdir.to_path_buf(),
        iteration_timeout: Duration::from_secs(60),
        agent_output_limit_bytes: 100_000,
        verify: VerifySettings::default(),
        tracker: TrackerConfig::default(),
        recent_entries: 5,
        max_iterations: 20,
    }
}

/// One scripted agent response.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub transcript: String,
    pub exit: AgentExit,
    /// Files written before returning. Relative paths resolve against the
    /// session workdir.
    pub writes: Vec<(PathBuf, String)>,
    /// Trip this token while "running".
    pub cancel: Option<CancelToken>,
}

impl ScriptedTurn {
    pub fn says(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            exit: AgentExit::Finished,
            writes: Vec::new(),
            cancel: None,
        }
    }

    pub fn times_out(transcript: impl Into<String>) -> Self {
        Self {
            exit: AgentExit::TimedOut,
            ..Self::says(transcript)
        }
    }

    pub fn fails(code: i32) -> Self {
        Self {
            exit: AgentExit::Failed(Some(code)),
            ..Self::says("")
        }
    }

    pub fn writing(mut self, path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        self.writes.push((path.into(), contents.into()));
        self
    }

    pub fn cancelling(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Agent backend that replays queued turns and records the prompts it saw.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    turns: RefCell<VecDeque<ScriptedTurn>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(turns: Vec<ScriptedTurn>) -> Self {
        Self {
            turns: RefCell::new(turns.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    pub fn invocations(&self) -> usize {
        self.prompts.borrow().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }
}

impl AgentBackend for ScriptedAgent {
    fn run(&self, session: &SandboxSession, request: &AgentRequest, _cancel: &CancelToken) -> Result<AgentRun> {
        self.prompts.borrow_mut().push(request.prompt.clone());
        let turn = self
            .turns
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted agent has no turns left"))?;

        for (path, contents) in &turn.writes {
            let path = match session {
                SandboxSession::Host { workdir } if path.is_relative() => workdir.join(path),
                _ => path.clone(),
            };
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
            }
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        if let Some(cancel) = &turn.cancel {
            cancel.cancel();
        }
        Ok(AgentRun {
            transcript: turn.transcript,
            exit: turn.exit,
        })
    }
}

/// Verifier that passes everything except the configured step.
#[derive(Debug, Default)]
pub struct ScriptedVerifier {
    failing_step: Option<(String, i32)>,
    timing_out_step: Option<String>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedVerifier {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn failing_on(step: &str, exit_code: i32) -> Self {
        Self {
            failing_step: Some((step.to_string(), exit_code)),
            ..Self::default()
        }
    }

    pub fn timing_out_on(step: &str) -> Self {
        Self {
            timing_out_step: Some(step.to_string()),
            ..Self::default()
        }
    }

    /// Steps run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl Verifier for ScriptedVerifier {
    fn run(
        &self,
        _session: &SandboxSession,
        step: &str,
        command: &str,
        _timeout: Duration,
        _cancel: &CancelToken,
    ) -> Result<VerificationResult> {
        self.calls.borrow_mut().push(step.to_string());
        let exit_code = match &self.failing_step {
            Some((failing, code)) if failing == step => *code,
            _ => 0,
        };
        Ok(VerificationResult {
            step: step.to_string(),
            command: command.to_string(),
            exit_code: Some(exit_code),
            stdout: format!("{step} output\n"),
            stderr: String::new(),
            duration: Duration::from_millis(1),
            timed_out: self.timing_out_step.as_deref() == Some(step),
            cancelled: false,
        })
    }
}

/// Sandbox whose runtime never starts.
#[derive(Debug, Clone, Copy)]
pub struct FailingSandbox;

impl Sandbox for FailingSandbox {
    fn with_sandbox<T, F>(&self, _f: F) -> Result<T>
    where
        F: FnOnce(&SandboxSession) -> Result<T>,
    {
        Err(LoopError::SandboxUnavailable("scripted runtime is down".to_string()).into())
    }
}

/// In-memory [`StateStore`]. `failures` keeps every appended version.
#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    pub manifest: Manifest,
    pub ledger: Vec<ProgressEntry>,
    pub failures: Vec<FailureRecord>,
    pub iterations: Vec<IterationArtifacts>,
    saves: Cell<usize>,
}

impl MemoryStateStore {
    pub fn new(manifest: Manifest) -> Self {
        Self {
            manifest,
            ledger: Vec::new(),
            failures: Vec::new(),
            iterations: Vec::new(),
            saves: Cell::new(0),
        }
    }

    /// Number of manifest writes.
    pub fn saves(&self) -> usize {
        self.saves.get()
    }
}

impl StateStore for MemoryStateStore {
    fn load_manifest(&self) -> Result<Manifest> {
        Ok(self.manifest.clone())
    }

    fn save_manifest(&mut self, manifest: &Manifest) -> Result<()> {
        self.saves.set(self.saves.get() + 1);
        self.manifest = manifest.clone();
        Ok(())
    }

    fn manifest_fingerprint(&self) -> Result<Option<String>> {
        let bytes = serde_json::to_vec(&self.manifest).context("serialize manifest")?;
        Ok(Some(fingerprint(&bytes)))
    }

    fn append_progress(&mut self, entry: &ProgressEntry) -> Result<()> {
        self.ledger.push(entry.clone());
        Ok(())
    }

    fn progress_entries(&self) -> Result<Vec<ProgressEntry>> {
        Ok(self.ledger.clone())
    }

    fn progress_count(&self) -> Result<usize> {
        Ok(self.ledger.len())
    }

    fn append_failure(&mut self, record: &FailureRecord) -> Result<()> {
        self.failures.push(record.clone());
        Ok(())
    }

    fn failure_records(&self) -> Result<Vec<FailureRecord>> {
        Ok(collapse(self.failures.clone()))
    }

    fn record_iteration(&mut self, artifacts: &IterationArtifacts) -> Result<()> {
        self.iterations.push(artifacts.clone());
        Ok(())
    }
}

/// A ralph home and a separate target workspace, both temporary.
pub struct TestProject {
    pub home_dir: TempDir,
    pub target_dir: TempDir,
    pub home: RalphHome,
    pub paths: ProjectPaths,
}

impl TestProject {
    /// Initialize project `demo` with `manifest` imported.
    pub fn new(manifest: &Manifest) -> Result<Self> {
        let home_dir = tempfile::tempdir().context("create home tempdir")?;
        let target_dir = tempfile::tempdir().context("create target tempdir")?;
        let home = RalphHome::new(home_dir.path());

        let source = home_dir.path().join("import.json");
        let mut buf = serde_json::to_string_pretty(manifest).context("serialize manifest")?;
        buf.push('\n');
        fs::write(&source, buf).with_context(|| format!("write {}", source.display()))?;

        let paths = init_project(
            &home,
            "demo",
            target_dir.path(),
            &InitOptions {
                manifest: Some(source),
                force: false,
                now: "2026-01-01T00:00:00Z".to_string(),
            },
        )?;
        Ok(Self {
            home_dir,
            target_dir,
            home,
            paths,
        })
    }

    pub fn target(&self) -> &Path {
        self.target_dir.path()
    }
}
