//! Deterministic task selection.

use crate::manifest::{Manifest, Task};

/// Pick the pending task with the lowest priority; ties go to manifest order.
///
/// Returns `None` when every task is done.
pub fn next_pending_task(manifest: &Manifest) -> Option<&Task> {
    // `min_by_key` keeps the first of several equal minima.
    manifest
        .tasks
        .iter()
        .filter(|task| task.is_pending())
        .min_by_key(|task| task.priority)
}
