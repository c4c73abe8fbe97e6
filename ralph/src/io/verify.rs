//! Verification runner: configured lint/test/build commands in the target workspace.

use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::error::LoopError;
use crate::io::cancel::CancelToken;
use crate::io::config::VerifySettings;
use crate::io::process::run_command;
use crate::io::sandbox::SandboxSession;
use crate::manifest::VerifyConfig;

/// Fixed execution order of the named commands.
pub const STEP_ORDER: [&str; 3] = ["lint", "test", "build"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    /// `lint`, `test` or `build`.
    pub step: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// Killed at the timeout; a failure whatever the exit status.
    pub timed_out: bool,
    pub cancelled: bool,
}

impl VerificationResult {
    pub fn passed(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }

    /// Typed failure for this result, if it failed.
    pub fn error(&self, timeout: Duration) -> Option<LoopError> {
        if self.timed_out {
            return Some(LoopError::VerificationTimeout {
                command: self.step.clone(),
                timeout,
            });
        }
        if self.passed() || self.cancelled {
            return None;
        }
        Some(LoopError::VerificationFailed {
            command: self.step.clone(),
            exit_code: self.exit_code,
        })
    }
}

/// Results of one verification pass, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub results: Vec<VerificationResult>,
}

impl VerificationReport {
    /// True when every executed command passed. No commands passes vacuously.
    pub fn passed(&self) -> bool {
        self.results.iter().all(VerificationResult::passed)
    }

    pub fn cancelled(&self) -> bool {
        self.results.iter().any(|r| r.cancelled)
    }

    pub fn first_failure(&self) -> Option<&VerificationResult> {
        self.results.iter().find(|r| !r.passed())
    }

    /// Plain-text log written to `verify.log`.
    pub fn render_log(&self) -> String {
        if self.results.is_empty() {
            return "no verification commands configured\n".to_string();
        }
        let mut buf = String::new();
        for result in &self.results {
            let verdict = if result.timed_out {
                "timed out".to_string()
            } else if result.cancelled {
                "cancelled".to_string()
            } else {
                format!("exit {:?}", result.exit_code)
            };
            buf.push_str(&format!(
                "=== {} ({}) {verdict} in {}ms ===\n",
                result.step,
                result.command,
                result.duration.as_millis()
            ));
            buf.push_str("--- stdout ---\n");
            buf.push_str(&result.stdout);
            buf.push_str("\n--- stderr ---\n");
            buf.push_str(&result.stderr);
            buf.push('\n');
        }
        buf
    }
}

/// Runs a single verification command.
pub trait Verifier {
    fn run(
        &self,
        session: &SandboxSession,
        step: &str,
        command: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<VerificationResult>;
}

/// Runs commands through `sh -c` in the session.
#[derive(Debug, Clone)]
pub struct ShellVerifier {
    pub output_limit_bytes: usize,
}

impl Verifier for ShellVerifier {
    #[instrument(skip_all, fields(step, timeout_secs = timeout.as_secs()))]
    fn run(
        &self,
        session: &SandboxSession,
        step: &str,
        command: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<VerificationResult> {
        info!(command, "running verification command");
        let output = run_command(
            session.shell(command),
            None,
            timeout,
            self.output_limit_bytes,
            cancel,
            None,
        )?;
        let mut stdout = output.stdout_lossy();
        stdout.push_str(&output.stdout_truncated_notice(step));
        let mut stderr = output.stderr_lossy();
        stderr.push_str(&output.stderr_truncated_notice(step));
        Ok(VerificationResult {
            step: step.to_string(),
            command: command.to_string(),
            exit_code: output.status.code(),
            stdout,
            stderr,
            duration: output.duration,
            timed_out: output.timed_out,
            cancelled: output.cancelled,
        })
    }
}

/// Named commands in `STEP_ORDER`, skipping unset ones.
pub fn configured_steps(config: &VerifyConfig) -> Vec<(&'static str, &str)> {
    STEP_ORDER
        .into_iter()
        .filter_map(|step| {
            let command = match step {
                "lint" => config.lint.as_deref(),
                "test" => config.test.as_deref(),
                _ => config.build.as_deref(),
            }?;
            let command = command.trim();
            (!command.is_empty()).then_some((step, command))
        })
        .collect()
}

/// Run every configured command in order. Later commands are skipped after a
/// failure unless `settings.run_all` is set; cancellation always stops the pass.
pub fn run_suite<V: Verifier>(
    verifier: &V,
    session: &SandboxSession,
    config: &VerifyConfig,
    settings: &VerifySettings,
    cancel: &CancelToken,
) -> Result<VerificationReport> {
    let timeout = Duration::from_secs(settings.timeout_secs);
    let mut report = VerificationReport::default();
    for (step, command) in configured_steps(config) {
        let result = verifier.run(session, step, command, timeout, cancel)?;
        let passed = result.passed();
        let cancelled = result.cancelled;
        if !passed {
            warn!(step, exit_code = ?result.exit_code, timed_out = result.timed_out, "verification failed");
        }
        report.results.push(result);
        if cancelled || (!passed && !settings.run_all) {
            break;
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::sandbox::{NoopSandbox, Sandbox};

    fn verify(lint: Option<&str>, test: Option<&str>, build: Option<&str>) -> VerifyConfig {
        VerifyConfig {
            lint: lint.map(str::to_string),
            test: test.map(str::to_string),
            build: build.map(str::to_string),
            coverage_target: None,
        }
    }

    fn run_in_temp(config: &VerifyConfig, settings: &VerifySettings) -> VerificationReport {
        let temp = tempfile::tempdir().expect("tempdir");
        let verifier = ShellVerifier {
            output_limit_bytes: 10_000,
        };
        NoopSandbox::new(temp.path())
            .with_sandbox(|session| {
                run_suite(&verifier, session, config, settings, &CancelToken::new())
            })
            .expect("suite")
    }

    #[test]
    fn no_commands_pass_vacuously() {
        let report = run_in_temp(&VerifyConfig::default(), &VerifySettings::default());
        assert!(report.results.is_empty());
        assert!(report.passed());
    }

    #[test]
    fn runs_in_fixed_order_and_stops_on_failure() {
        let config = verify(Some("echo lint"), Some("echo test; exit 2"), Some("echo build"));
        let report = run_in_temp(&config, &VerifySettings::default());
        let steps: Vec<&str> = report.results.iter().map(|r| r.step.as_str()).collect();
        assert_eq!(steps, vec!["lint", "test"]);
        assert!(!report.passed());
        let failure = report.first_failure().expect("failure");
        assert_eq!(failure.exit_code, Some(2));
        assert_eq!(
            failure.error(Duration::from_secs(1)),
            Some(LoopError::VerificationFailed {
                command: "test".to_string(),
                exit_code: Some(2)
            })
        );
    }

    #[test]
    fn run_all_keeps_going() {
        let config = verify(Some("exit 1"), None, Some("echo built"));
        let settings = VerifySettings {
            run_all: true,
            ..VerifySettings::default()
        };
        let report = run_in_temp(&config, &settings);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[1].stdout, "built\n");
        assert!(report.render_log().contains("=== build (echo built) exit Some(0)"));
    }

    #[test]
    fn timeout_counts_as_failure_even_with_zero_exit() {
        let result = VerificationResult {
            step: "test".to_string(),
            command: "sleep 9".to_string(),
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_secs(1),
            timed_out: true,
            cancelled: false,
        };
        assert!(!result.passed());
        assert!(matches!(
            result.error(Duration::from_secs(1)),
            Some(LoopError::VerificationTimeout { .. })
        ));
    }
}
