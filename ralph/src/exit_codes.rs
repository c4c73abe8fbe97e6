//! Stable exit codes for ralph CLI commands.

use crate::core::types::HaltReason;

/// Command succeeded, or the loop halted with every task done.
pub const OK: i32 = 0;
/// Invalid layout/config/manifest, fatal loop error, or any other failure.
pub const ERROR: i32 = 1;
/// The agent emitted GUTTER and needs a human.
pub const GUTTER: i32 = 2;
/// The iteration budget ran out with tasks still pending.
pub const MAX_ITERATIONS: i32 = 3;
/// An operator stop interrupted the run.
pub const CANCELLED: i32 = 4;

pub fn for_halt(reason: HaltReason) -> i32 {
    match reason {
        HaltReason::Complete => OK,
        HaltReason::Gutter => GUTTER,
        HaltReason::MaxIterationsReached => MAX_ITERATIONS,
        HaltReason::Cancelled => CANCELLED,
    }
}
