//! Global configuration stored in `<home>/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::failure_tracker::TrackerConfig;
use crate::io::atomic::write_atomic;

/// Tools granted to the agent unless configured otherwise.
pub const DEFAULT_TOOLS: &[&str] = &["Read", "Write", "Edit", "Bash", "Glob", "Grep", "TodoWrite"];

/// ralph configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below, and a missing file means all defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RalphConfig {
    /// Wall-clock budget for one agent invocation, in seconds.
    pub iteration_timeout_secs: u64,

    /// Truncate agent transcripts beyond this many bytes.
    pub agent_output_limit_bytes: usize,

    /// Truncate verification stdout/stderr beyond this many bytes.
    pub verify_output_limit_bytes: usize,

    /// Entries from the ledger shown by `ralph status` and fed to the agent.
    pub recent_entries: usize,

    pub agent: AgentConfig,
    pub sandbox: SandboxConfig,
    pub tracker: TrackerConfig,
    pub verify: VerifySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI and leading arguments; the prompt goes to stdin.
    pub command: Vec<String>,
    /// Passed as `--model` when set.
    pub model: Option<String>,
    /// Tool names passed as `--allowedTools`.
    pub tools: Vec<String>,
    /// Extra arguments appended after the generated ones.
    pub extra_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            model: None,
            tools: DEFAULT_TOOLS.iter().map(|tool| tool.to_string()).collect(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Run agent and verification inside a container by default.
    pub enabled: bool,
    /// Container runtime binary.
    pub runtime: String,
    pub image: String,
    /// Host environment variables forwarded into the container. Nothing else is.
    pub forward_env: Vec<String>,
    /// Give the container network access (the agent usually needs its API).
    pub network: bool,
    /// Upper bound on container lifetime, in seconds.
    pub lifetime_secs: u64,
    /// Run on the host when the runtime cannot start.
    pub allow_unsandboxed_fallback: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            runtime: "docker".to_string(),
            image: "ralph-sandbox:latest".to_string(),
            forward_env: vec!["ANTHROPIC_API_KEY".to_string()],
            network: true,
            lifetime_secs: 4 * 60 * 60,
            allow_unsandboxed_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifySettings {
    /// Per-command timeout, in seconds.
    pub timeout_secs: u64,
    /// Keep running later commands after one fails.
    pub run_all: bool,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10 * 60,
            run_all: false,
        }
    }
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            iteration_timeout_secs: 30 * 60,
            agent_output_limit_bytes: 500_000,
            verify_output_limit_bytes: 100_000,
            recent_entries: 5,
            agent: AgentConfig::default(),
            sandbox: SandboxConfig::default(),
            tracker: TrackerConfig::default(),
            verify: VerifySettings::default(),
        }
    }
}

impl RalphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        if self.verify_output_limit_bytes == 0 {
            return Err(anyhow!("verify_output_limit_bytes must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.sandbox.runtime.trim().is_empty() || self.sandbox.image.trim().is_empty() {
            return Err(anyhow!("sandbox.runtime and sandbox.image must be set"));
        }
        if self.sandbox.lifetime_secs == 0 {
            return Err(anyhow!("sandbox.lifetime_secs must be > 0"));
        }
        if self.tracker.window < 2 {
            return Err(anyhow!("tracker.window must be >= 2"));
        }
        if self.tracker.promote_after == 0 {
            return Err(anyhow!("tracker.promote_after must be > 0"));
        }
        if self.verify.timeout_secs == 0 {
            return Err(anyhow!("verify.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RalphConfig::default()`.
pub fn load_config(path: &Path) -> Result<RalphConfig> {
    if !path.exists() {
        let cfg = RalphConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RalphConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RalphConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
