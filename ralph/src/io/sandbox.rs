//! Isolation boundary for agent and verification processes.
//!
//! A [`Sandbox`] hands a [`SandboxSession`] to a closure and tears the session
//! down on every exit path. Processes are always built through the session so
//! callers never care whether they run on the host or in a container.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::error::LoopError;
use crate::io::config::SandboxConfig;

/// Mount point of the target workspace inside the container.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// Where child processes of one iteration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxSession {
    Host { workdir: PathBuf },
    Container { runtime: String, name: String },
}

impl SandboxSession {
    /// Build a command for `program` in the session's working directory.
    pub fn command(&self, program: &str, args: &[String]) -> Command {
        match self {
            SandboxSession::Host { workdir } => {
                let mut cmd = Command::new(program);
                cmd.args(args).current_dir(workdir);
                cmd
            }
            SandboxSession::Container { runtime, name } => {
                let mut cmd = Command::new(runtime);
                cmd.args(["exec", "-i", "-w", CONTAINER_WORKDIR])
                    .arg(name)
                    .arg(program)
                    .args(args);
                cmd
            }
        }
    }

    /// `sh -c <script>` in the session.
    pub fn shell(&self, script: &str) -> Command {
        self.command("sh", &["-c".to_string(), script.to_string()])
    }

    pub fn is_isolated(&self) -> bool {
        matches!(self, SandboxSession::Container { .. })
    }

    /// Workspace path as seen by processes in this session.
    pub fn workdir_display(&self) -> String {
        match self {
            SandboxSession::Host { workdir } => workdir.display().to_string(),
            SandboxSession::Container { .. } => CONTAINER_WORKDIR.to_string(),
        }
    }
}

/// Scoped acquisition of an execution context.
pub trait Sandbox {
    /// Run `f` inside a fresh session. Fails with [`LoopError::SandboxUnavailable`]
    /// if the session cannot be started.
    fn with_sandbox<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SandboxSession) -> Result<T>;
}

/// Host execution in the target workspace.
#[derive(Debug, Clone)]
pub struct NoopSandbox {
    workdir: PathBuf,
}

impl NoopSandbox {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }
}

impl Sandbox for NoopSandbox {
    fn with_sandbox<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SandboxSession) -> Result<T>,
    {
        f(&SandboxSession::Host {
            workdir: self.workdir.clone(),
        })
    }
}

/// One container per session: `run -d` to start, `exec` per process, `rm -f` on drop.
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    config: SandboxConfig,
    workdir: PathBuf,
    name_prefix: String,
}

impl DockerSandbox {
    pub fn new(config: SandboxConfig, workdir: impl Into<PathBuf>, project: &str) -> Self {
        Self {
            config,
            workdir: workdir.into(),
            name_prefix: format!("ralph-{project}"),
        }
    }

    /// Arguments for `<runtime> run`. Only the target workspace is mounted and
    /// only configured variables are forwarded.
    pub fn run_args(&self, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-v".to_string(),
            format!("{}:{CONTAINER_WORKDIR}", self.workdir.display()),
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
        ];
        if !self.config.network {
            args.push("--network".to_string());
            args.push("none".to_string());
        }
        for var in &self.config.forward_env {
            if std::env::var_os(var).is_some() {
                // `-e NAME` copies the value from our environment.
                args.push("-e".to_string());
                args.push(var.clone());
            }
        }
        args.push(self.config.image.clone());
        // The container dies on its own once the lifetime is over.
        args.push("sleep".to_string());
        args.push(self.config.lifetime_secs.to_string());
        args
    }

    #[instrument(skip_all, fields(image = %self.config.image))]
    fn start(&self) -> Result<ContainerGuard, LoopError> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        let name = format!("{}-{}-{nanos}", self.name_prefix, std::process::id());
        let output = Command::new(&self.config.runtime)
            .args(self.run_args(&name))
            .stdin(Stdio::null())
            .output()
            .map_err(|err| {
                LoopError::SandboxUnavailable(format!("spawn {}: {err}", self.config.runtime))
            })?;
        if !output.status.success() {
            return Err(LoopError::SandboxUnavailable(format!(
                "{} run failed: {}",
                self.config.runtime,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!(container = %name, "sandbox started");
        Ok(ContainerGuard {
            runtime: self.config.runtime.clone(),
            name,
        })
    }
}

impl Sandbox for DockerSandbox {
    fn with_sandbox<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SandboxSession) -> Result<T>,
    {
        let guard = match self.start() {
            Ok(guard) => guard,
            Err(err) if self.config.allow_unsandboxed_fallback => {
                warn!(err = %err, "sandbox unavailable, falling back to host execution");
                return NoopSandbox::new(&self.workdir).with_sandbox(f);
            }
            Err(err) => return Err(err.into()),
        };
        let session = SandboxSession::Container {
            runtime: guard.runtime.clone(),
            name: guard.name.clone(),
        };
        // `guard` removes the container when this frame unwinds or returns.
        f(&session)
    }
}

/// Removes the container on drop, including during panics.
#[derive(Debug)]
struct ContainerGuard {
    runtime: String,
    name: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let result = Command::new(&self.runtime)
            .args(["rm", "-f", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match result {
            Ok(status) if status.success() => debug!(container = %self.name, "sandbox removed"),
            Ok(status) => {
                warn!(container = %self.name, code = ?status.code(), "sandbox removal failed");
            }
            Err(err) => warn!(container = %self.name, err = %err, "sandbox removal failed"),
        }
    }
}

/// Pick the sandbox implementation for a run.
pub enum RunSandbox {
    Host(NoopSandbox),
    Docker(DockerSandbox),
}

impl RunSandbox {
    pub fn new(enabled: bool, config: SandboxConfig, workdir: &Path, project: &str) -> Self {
        if enabled {
            RunSandbox::Docker(DockerSandbox::new(config, workdir, project))
        } else {
            RunSandbox::Host(NoopSandbox::new(workdir))
        }
    }
}

impl Sandbox for RunSandbox {
    fn with_sandbox<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SandboxSession) -> Result<T>,
    {
        match self {
            RunSandbox::Host(sandbox) => sandbox.with_sandbox(f),
            RunSandbox::Docker(sandbox) => sandbox.with_sandbox(f),
        }
    }
}
