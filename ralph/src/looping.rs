//! Multi-iteration driver for `ralph run`.

use anyhow::Result;
use tracing::{info, instrument};

use crate::core::selector::next_pending_task;
use crate::core::types::HaltReason;
use crate::io::agent::AgentBackend;
use crate::io::cancel::CancelToken;
use crate::io::sandbox::Sandbox;
use crate::io::state_store::StateStore;
use crate::io::verify::Verifier;
use crate::step::{IterationReport, StepConfig, StepOutcome, run_step};

/// Summary of a loop run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub halt: HaltReason,
    /// Iterations recorded by this run.
    pub iterations_run: u32,
    pub done: usize,
    pub total: usize,
}

/// Run iterations until every task is done, the agent signals GUTTER, the
/// iteration budget is spent, or `cancel` trips.
///
/// Iteration-local failures are recorded in the ledger and the loop goes on.
/// Any error returned by a step (corrupt manifest, unavailable sandbox, state
/// I/O) stops the loop.
#[instrument(skip_all, fields(max_iterations = config.max_iterations))]
pub fn run_loop<S, A, V, X, F>(
    store: &mut S,
    agent: &A,
    verifier: &V,
    sandbox: &X,
    config: &StepConfig,
    cancel: &CancelToken,
    mut on_step: F,
) -> Result<LoopOutcome>
where
    S: StateStore,
    A: AgentBackend,
    V: Verifier,
    X: Sandbox,
    F: FnMut(&IterationReport),
{
    let mut iterations_run = 0u32;
    let halt = loop {
        if cancel.is_cancelled() {
            break HaltReason::Cancelled;
        }
        // Checked before the budget so a finished manifest reports Complete.
        if next_pending_task(&store.load_manifest()?).is_none() {
            break HaltReason::Complete;
        }
        if iterations_run >= config.max_iterations {
            break HaltReason::MaxIterationsReached;
        }

        match run_step(store, agent, verifier, sandbox, config, cancel)? {
            StepOutcome::Complete => break HaltReason::Complete,
            StepOutcome::Cancelled { .. } => break HaltReason::Cancelled,
            StepOutcome::Ran(report) => {
                iterations_run += 1;
                on_step(&report);
                if let Some(halt) = report.halt {
                    break halt;
                }
            }
        }
    };

    let manifest = store.load_manifest()?;
    let outcome = LoopOutcome {
        halt,
        iterations_run,
        done: manifest.done_count(),
        total: manifest.tasks.len(),
    };
    info!(halt = %outcome.halt, iterations = iterations_run, done = outcome.done, total = outcome.total, "loop stopped");
    Ok(outcome)
}
