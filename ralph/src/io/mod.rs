//! I/O helpers for ralph commands.

pub mod agent;
pub mod artifacts;
pub mod atomic;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod failure_log;
pub mod footprint;
pub mod git;
pub mod ledger;
pub mod lock;
pub mod manifest_store;
pub mod process;
pub mod project;
pub mod prompt;
pub mod run_state;
pub mod sandbox;
pub mod state_store;
pub mod verify;
