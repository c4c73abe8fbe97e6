//! Deterministic, pure logic shared by the loop controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod error;
pub mod failure_tracker;
pub mod invariants;
pub mod selector;
pub mod state_update;
pub mod transcript;
pub mod types;
