//! Shared time budget helpers for deterministic orchestration.

use std::time::{Duration, Instant};

use crate::core::error::LoopError;

/// Return the remaining time budget until the provided deadline.
///
/// An exhausted budget is reported as an invocation timeout, since only the
/// agent call consumes the per-iteration budget.
pub fn remaining_budget(deadline: Instant, limit: Duration) -> Result<Duration, LoopError> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return Err(LoopError::InvocationTimeout(limit));
    }
    Ok(remaining)
}
