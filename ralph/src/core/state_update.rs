//! Controller-owned manifest transitions.
//!
//! Every function takes the manifest by value and hands back the next version,
//! so callers always hold exactly one owned copy of the authoritative state.

use crate::core::error::LoopError;
use crate::manifest::{Guardrail, Manifest, TaskStatus};

/// Mark `task_id` done.
///
/// Marking an already-done task is a no-op and leaves the revision untouched.
pub fn mark_done(mut manifest: Manifest, task_id: &str) -> Result<Manifest, LoopError> {
    let task = manifest
        .tasks
        .iter_mut()
        .find(|task| task.id == task_id)
        .ok_or_else(|| LoopError::TaskNotFound(task_id.to_string()))?;
    if task.status == TaskStatus::Done {
        return Ok(manifest);
    }
    task.status = TaskStatus::Done;
    manifest.revision += 1;
    Ok(manifest)
}

/// Append a guardrail. Guardrails are a log of lessons, not a keyed table:
/// a repeated name is accepted as long as the lesson differs.
pub fn append_guardrail(mut manifest: Manifest, guardrail: Guardrail) -> Result<Manifest, LoopError> {
    if manifest
        .guardrails
        .iter()
        .any(|existing| existing.same_content(&guardrail))
    {
        return Err(LoopError::GuardrailExists(guardrail.name));
    }
    manifest.guardrails.push(guardrail);
    manifest.revision += 1;
    Ok(manifest)
}
