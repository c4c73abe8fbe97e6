//! Iteration loop controller for autonomous coding agents.
//!
//! An agent CLI is invoked repeatedly against a persistent task manifest. Each
//! call is stateless; continuity lives in the manifest, an append-only progress
//! ledger and a failure log. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (task selection, manifest updates,
//!   transcript parsing, failure heuristics). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, git, processes, sandbox).
//!   Traits at each seam so tests can script the agent and the verifier.
//!
//! Orchestration modules ([`step`], [`looping`], [`status`]) coordinate core
//! logic with I/O to implement the CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod manifest;
pub mod status;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
