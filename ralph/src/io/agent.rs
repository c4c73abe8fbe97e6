//! Agent invocation.
//!
//! The [`AgentBackend`] trait decouples the controller from the actual agent
//! CLI (`claude -p` by default). Tests use scripted backends that return
//! predetermined transcripts without spawning processes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::error::LoopError;
use crate::core::transcript::extract_signal;
use crate::core::types::Signal;
use crate::io::cancel::CancelToken;
use crate::io::config::AgentConfig;
use crate::io::footprint::{files_touched, snapshot};
use crate::io::process::run_command;
use crate::io::sandbox::SandboxSession;

/// Parameters for one agent call.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub timeout: Duration,
    /// Truncate the captured transcript beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Stream the transcript here while the agent runs.
    pub transcript_path: Option<PathBuf>,
}

/// How the agent process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    Finished,
    Failed(Option<i32>),
    TimedOut,
    Cancelled,
}

/// Raw result of a backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRun {
    pub transcript: String,
    pub exit: AgentExit,
}

/// Abstraction over agent backends.
pub trait AgentBackend {
    fn run(
        &self,
        session: &SandboxSession,
        request: &AgentRequest,
        cancel: &CancelToken,
    ) -> Result<AgentRun>;
}

/// Tool surface granted to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPolicy {
    pub allowed: Vec<String>,
    /// Paths the agent may read but never write or edit.
    pub protected_paths: Vec<PathBuf>,
}

impl ToolPolicy {
    pub fn cli_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if !self.allowed.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed.join(","));
        }
        if !self.protected_paths.is_empty() {
            args.push("--disallowedTools".to_string());
            for path in &self.protected_paths {
                args.push(format!("Write({})", path.display()));
                args.push(format!("Edit({})", path.display()));
            }
        }
        args
    }
}

/// Backend that spawns the configured agent CLI with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    config: AgentConfig,
    policy: ToolPolicy,
}

impl CommandAgent {
    pub fn new(config: AgentConfig, policy: ToolPolicy) -> Self {
        Self { config, policy }
    }

    fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = self.config.command.iter().skip(1).cloned().collect();
        if let Some(model) = &self.config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.extend(self.policy.cli_args());
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

impl AgentBackend for CommandAgent {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), isolated = session.is_isolated()))]
    fn run(
        &self,
        session: &SandboxSession,
        request: &AgentRequest,
        cancel: &CancelToken,
    ) -> Result<AgentRun> {
        let program = self
            .config
            .command
            .first()
            .ok_or_else(|| anyhow!("agent.command is empty"))?;
        info!(program = %program, "starting agent");
        let cmd = session.command(program, &self.args());
        let output = run_command(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            cancel,
            request.transcript_path.as_deref(),
        )
        .with_context(|| format!("run agent {program}"))?;

        let mut transcript = output.stdout_lossy();
        transcript.push_str(&output.stdout_truncated_notice("agent"));

        let exit = if output.cancelled {
            AgentExit::Cancelled
        } else if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            AgentExit::TimedOut
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), stderr = %output.stderr_lossy().trim(), "agent failed");
            AgentExit::Failed(output.status.code())
        } else {
            AgentExit::Finished
        };
        debug!(transcript_bytes = transcript.len(), ?exit, "agent finished");
        Ok(AgentRun { transcript, exit })
    }
}

/// What the controller learns from one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationResult {
    pub transcript: String,
    pub signal: Signal,
    /// Workspace-relative paths changed during the call, sorted.
    pub files_touched: Vec<String>,
    pub exit: AgentExit,
}

impl InvocationResult {
    /// Typed error for an invocation that did not finish normally.
    pub fn error(&self, timeout: Duration) -> Option<LoopError> {
        match self.exit {
            AgentExit::TimedOut => Some(LoopError::InvocationTimeout(timeout)),
            _ => None,
        }
    }
}

/// Run one bounded agent call and observe its effect on `workdir`.
///
/// Only a normally finished call yields a signal; timeouts, failures and
/// cancellations count as CONTINUE.
#[instrument(skip_all, fields(workdir = %workdir.display()))]
pub fn invoke<A: AgentBackend>(
    backend: &A,
    session: &SandboxSession,
    workdir: &Path,
    request: &AgentRequest,
    cancel: &CancelToken,
) -> Result<InvocationResult> {
    let before = snapshot(workdir).context("snapshot workspace before agent")?;
    let run = backend.run(session, request, cancel)?;
    let after = snapshot(workdir).context("snapshot workspace after agent")?;
    let files_touched = files_touched(workdir, &before, &after)?;

    let signal = match run.exit {
        AgentExit::Finished => extract_signal(&run.transcript),
        _ => Signal::Continue,
    };
    debug!(signal = signal.as_str(), files = files_touched.len(), "invocation observed");
    Ok(InvocationResult {
        transcript: run.transcript,
        signal,
        files_touched,
        exit: run.exit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transcript::GUTTER_MARKER;
    use crate::io::sandbox::{NoopSandbox, Sandbox};

    fn request() -> AgentRequest {
        AgentRequest {
            prompt: "do the thing".to_string(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
            transcript_path: None,
        }
    }

    fn shell_agent(script: &str) -> CommandAgent {
        CommandAgent::new(
            AgentConfig {
                command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
                model: None,
                tools: Vec::new(),
                extra_args: Vec::new(),
            },
            ToolPolicy {
                allowed: Vec::new(),
                protected_paths: Vec::new(),
            },
        )
    }

    #[test]
    fn policy_denies_writes_to_protected_paths() {
        let policy = ToolPolicy {
            allowed: vec!["Read".to_string(), "Edit".to_string()],
            protected_paths: vec![PathBuf::from("/state/manifest.json")],
        };
        assert_eq!(
            policy.cli_args(),
            vec![
                "--allowedTools",
                "Read,Edit",
                "--disallowedTools",
                "Write(/state/manifest.json)",
                "Edit(/state/manifest.json)"
            ]
        );
    }

    #[test]
    fn command_agent_reads_prompt_and_reports_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = shell_agent(&format!("cat > prompt.txt; echo '{GUTTER_MARKER}'"));
        let result = NoopSandbox::new(temp.path())
            .with_sandbox(|session| {
                invoke(&agent, session, temp.path(), &request(), &CancelToken::new())
            })
            .expect("invoke");
        assert_eq!(result.exit, AgentExit::Finished);
        assert_eq!(result.signal, Signal::Gutter);
        assert_eq!(result.files_touched, vec!["prompt.txt"]);
        let prompt = std::fs::read_to_string(temp.path().join("prompt.txt")).expect("read");
        assert_eq!(prompt, "do the thing");
    }

    #[test]
    fn failed_agent_signals_continue() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = shell_agent(&format!("echo '{GUTTER_MARKER}'; exit 7"));
        let result = NoopSandbox::new(temp.path())
            .with_sandbox(|session| {
                invoke(&agent, session, temp.path(), &request(), &CancelToken::new())
            })
            .expect("invoke");
        assert_eq!(result.exit, AgentExit::Failed(Some(7)));
        assert_eq!(result.signal, Signal::Continue);
    }

    #[test]
    fn timeout_maps_to_invocation_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = shell_agent("sleep 5");
        let mut req = request();
        req.timeout = Duration::from_millis(200);
        let result = NoopSandbox::new(temp.path())
            .with_sandbox(|session| invoke(&agent, session, temp.path(), &req, &CancelToken::new()))
            .expect("invoke");
        assert_eq!(result.exit, AgentExit::TimedOut);
        assert_eq!(
            result.error(req.timeout),
            Some(LoopError::InvocationTimeout(req.timeout))
        );
    }
}
