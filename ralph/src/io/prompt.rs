//! Instruction rendering for agent invocations.
//!
//! Every loop kind maps to one fixed template; all of them include the shared
//! contract section so the controller can parse the reply the same way.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{Alert, LoopKind};
use crate::io::verify::configured_steps;
use crate::manifest::{Guardrail, Manifest, Task};

const CONTRACT_TEMPLATE: &str = include_str!("prompts/contract.md");
const DEFAULT_TEMPLATE: &str = include_str!("prompts/default.md");
const TEST_COVERAGE_TEMPLATE: &str = include_str!("prompts/test_coverage.md");
const LINTING_TEMPLATE: &str = include_str!("prompts/linting.md");
const DUPLICATION_TEMPLATE: &str = include_str!("prompts/duplication.md");
const ENTROPY_TEMPLATE: &str = include_str!("prompts/entropy.md");

fn template_name(kind: LoopKind) -> &'static str {
    match kind {
        LoopKind::Default => "default.md",
        LoopKind::TestCoverage => "test_coverage.md",
        LoopKind::Linting => "linting.md",
        LoopKind::Duplication => "duplication.md",
        LoopKind::Entropy => "entropy.md",
    }
}

/// Everything a template can reference.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub loop_kind: LoopKind,
    pub manifest: &'a Manifest,
    pub task: &'a Task,
    /// Workspace path as seen by the agent.
    pub workdir: String,
    /// Host path of the manifest; omitted when the agent cannot reach it.
    pub manifest_path: Option<String>,
    pub ledger_path: Option<String>,
    pub alerts: &'a [Alert],
    /// Rendered tail of the progress ledger.
    pub recent: String,
    pub iteration: u32,
    pub max_iterations: u32,
}

#[derive(Debug, Serialize)]
struct GuardrailContext<'a> {
    name: &'a str,
    trigger: &'a str,
    instruction: &'a str,
}

impl<'a> From<&'a Guardrail> for GuardrailContext<'a> {
    fn from(guardrail: &'a Guardrail) -> Self {
        Self {
            name: &guardrail.name,
            trigger: &guardrail.trigger,
            instruction: &guardrail.instruction,
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            ("contract.md", CONTRACT_TEMPLATE),
            ("default.md", DEFAULT_TEMPLATE),
            ("test_coverage.md", TEST_COVERAGE_TEMPLATE),
            ("linting.md", LINTING_TEMPLATE),
            ("duplication.md", DUPLICATION_TEMPLATE),
            ("entropy.md", ENTROPY_TEMPLATE),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("load prompt template {name}"))?;
        }
        Ok(Self { env })
    }

    pub fn render(&self, input: &PromptInputs<'_>) -> Result<String> {
        let name = template_name(input.loop_kind);
        let template = self.env.get_template(name)?;
        let manifest_json =
            serde_json::to_string_pretty(input.manifest).context("serialize manifest snapshot")?;
        let guardrails: Vec<GuardrailContext<'_>> =
            input.manifest.guardrails.iter().map(Into::into).collect();
        let alerts: Vec<String> = input.alerts.iter().map(Alert::describe).collect();
        let verify_commands: Vec<&str> = configured_steps(&input.manifest.verify)
            .into_iter()
            .map(|(_, command)| command)
            .collect();
        let rendered = template
            .render(context! {
                task => input.task,
                workdir => &input.workdir,
                manifest_path => input.manifest_path.as_deref(),
                ledger_path => input.ledger_path.as_deref(),
                guardrails => guardrails,
                alerts => alerts,
                recent => (!input.recent.trim().is_empty()).then(|| input.recent.trim()),
                manifest_json => manifest_json,
                verify_commands => verify_commands,
                coverage_target => input.manifest.verify.coverage_target,
                iteration => input.iteration,
                max_iterations => input.max_iterations,
            })
            .with_context(|| format!("render prompt template {name}"))?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transcript::{COMPLETE_MARKER, GUTTER_MARKER};
    use crate::test_support::{manifest_with, task};

    fn inputs<'a>(
        kind: LoopKind,
        manifest: &'a Manifest,
        alerts: &'a [Alert],
    ) -> PromptInputs<'a> {
        PromptInputs {
            loop_kind: kind,
            manifest,
            task: &manifest.tasks[0],
            workdir: "/work/app".to_string(),
            manifest_path: Some("/home/u/.ralph/projects/app/manifest.json".to_string()),
            ledger_path: None,
            alerts,
            recent: String::new(),
            iteration: 2,
            max_iterations: 5,
        }
    }

    #[test]
    fn every_kind_carries_the_contract() {
        let engine = PromptEngine::new().expect("engine");
        let manifest = manifest_with(vec![task("1.1", 1)]);
        for kind in [
            LoopKind::Default,
            LoopKind::TestCoverage,
            LoopKind::Linting,
            LoopKind::Duplication,
            LoopKind::Entropy,
        ] {
            let prompt = engine.render(&inputs(kind, &manifest, &[])).expect("render");
            assert!(prompt.contains(COMPLETE_MARKER), "{kind}");
            assert!(prompt.contains(GUTTER_MARKER), "{kind}");
            assert!(prompt.contains("<task-done>1.1</task-done>"), "{kind}");
            assert!(prompt.contains("iteration 2 of at most 5"), "{kind}");
        }
    }

    #[test]
    fn includes_guardrails_alerts_and_paths() {
        let engine = PromptEngine::new().expect("engine");
        let mut manifest = manifest_with(vec![task("1.1", 1)]);
        manifest.guardrails.push(Guardrail {
            name: "no-network".to_string(),
            trigger: "writing tests".to_string(),
            instruction: "Use the fixture server.".to_string(),
            added_after: String::new(),
        });
        manifest.verify.test = Some("cargo test".to_string());
        let alerts = vec![Alert::ScopeCreep {
            files_touched: 14,
            threshold: 10,
        }];
        let prompt = engine
            .render(&inputs(LoopKind::Default, &manifest, &alerts))
            .expect("render");
        assert!(prompt.contains("**no-network** (when writing tests): Use the fixture server."));
        assert!(prompt.contains("Scope creep: last iteration touched 14 files"));
        assert!(prompt.contains("/home/u/.ralph/projects/app/manifest.json"));
        assert!(prompt.contains("The controller will run: cargo test."));
        assert!(!prompt.contains("Progress ledger"));
    }

    #[test]
    fn coverage_target_reaches_coverage_template() {
        let engine = PromptEngine::new().expect("engine");
        let mut manifest = manifest_with(vec![task("1.1", 1)]);
        manifest.verify.coverage_target = Some(80.0);
        let prompt = engine
            .render(&inputs(LoopKind::TestCoverage, &manifest, &[]))
            .expect("render");
        assert!(prompt.contains("toward 80.0%"));
    }
}
