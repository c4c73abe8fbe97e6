//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::manifest::Manifest;

/// Check semantic manifest invariants:
/// - No duplicate task ids
/// - Task ids and guardrail names are non-blank
/// - Task ids fit on one ledger header line (no backticks or line breaks)
/// - `max_iterations > 0`
pub fn validate_invariants(manifest: &Manifest) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    if manifest.max_iterations == 0 {
        errors.push("max_iterations must be > 0".to_string());
    }

    for (idx, task) in manifest.tasks.iter().enumerate() {
        if task.id.trim().is_empty() {
            errors.push(format!("tasks[{idx}]: id must not be blank"));
            continue;
        }
        if task.id.contains(['`', '\n', '\r']) {
            errors.push(format!(
                "tasks[{idx}]: id must not contain backticks or line breaks"
            ));
        }
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("duplicate task id '{}' at tasks[{idx}]", task.id));
        }
    }

    for (idx, guardrail) in manifest.guardrails.iter().enumerate() {
        if guardrail.name.trim().is_empty() {
            errors.push(format!("guardrails[{idx}]: name must not be blank"));
        }
    }

    errors
}
