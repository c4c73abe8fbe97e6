//! Typed failure taxonomy for the loop controller.
//!
//! These values travel inside `anyhow::Error` through the I/O layers and are
//! recovered with `downcast_ref` where the controller has to decide between
//! recording a failure and halting.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError {
    /// Persisted manifest is unreadable or violates the schema. Fatal.
    #[error("manifest corrupt: {0}")]
    ManifestCorrupt(String),

    #[error("task '{0}' not found in manifest")]
    TaskNotFound(String),

    #[error("guardrail '{0}' already exists with identical content")]
    GuardrailExists(String),

    #[error("verification command '{command}' timed out after {timeout:?}")]
    VerificationTimeout { command: String, timeout: Duration },

    #[error("verification command '{command}' failed with exit code {exit_code:?}")]
    VerificationFailed {
        command: String,
        exit_code: Option<i32>,
    },

    /// The isolation runtime could not be started. Fatal unless fallback was requested.
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    #[error("agent invocation timed out after {0:?}")]
    InvocationTimeout(Duration),
}

impl LoopError {
    /// Errors that stop the loop instead of being recorded against one iteration.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LoopError::ManifestCorrupt(_) | LoopError::SandboxUnavailable(_)
        )
    }
}

/// Find a [`LoopError`] anywhere in an `anyhow` error chain.
pub fn find_loop_error(err: &anyhow::Error) -> Option<&LoopError> {
    err.chain().find_map(|cause| cause.downcast_ref::<LoopError>())
}
