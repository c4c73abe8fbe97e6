//! Task manifest data model (`manifest.json`).

use serde::{Deserialize, Serialize};

/// Completion state of a task. Only the loop controller flips `Pending` to `Done`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Done => "done",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub priority: i64,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Task {
    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}

/// A standing, agent-interpreted instruction learned from a past failure.
///
/// `trigger` is natural language; the controller never evaluates it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Guardrail {
    pub name: String,
    pub trigger: String,
    pub instruction: String,
    #[serde(default)]
    pub added_after: String,
}

impl Guardrail {
    /// True if both guardrails carry the same lesson (name, trigger and instruction).
    pub fn same_content(&self, other: &Guardrail) -> bool {
        self.name == other.name
            && self.trigger == other.trigger
            && self.instruction == other.instruction
    }
}

/// Shell commands used to verify a claimed task.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VerifyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
    /// Coverage percentage handed to the test-coverage loop. Not executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_target: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub name: String,
    pub max_iterations: u32,
    #[serde(default)]
    pub verify: VerifyConfig,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub guardrails: Vec<Guardrail>,
    /// Bumped by every effective mutation applied through the manifest store.
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
}

impl Manifest {
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn done_count(&self) -> usize {
        self.tasks.iter().filter(|task| !task.is_pending()).count()
    }

    /// Ids of completed tasks, in manifest order.
    pub fn done_ids(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|task| !task.is_pending())
            .map(|task| task.id.as_str())
            .collect()
    }
}

/// Starter manifest written by `ralph init` when no manifest is imported.
pub fn default_manifest(name: &str) -> Manifest {
    Manifest {
        name: name.to_string(),
        max_iterations: 20,
        verify: VerifyConfig::default(),
        tasks: vec![Task {
            id: "1.1".to_string(),
            name: "Describe the first task".to_string(),
            description: "Replace this placeholder with a real task.".to_string(),
            status: TaskStatus::Pending,
            priority: 1,
            success_criteria: vec!["The placeholder task is replaced".to_string()],
            notes: None,
        }],
        guardrails: Vec::new(),
        revision: 0,
        created: None,
        updated: None,
    }
}
