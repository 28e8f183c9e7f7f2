//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between the discovery engine, the budget
//! predictor and the loop. They do not touch external state.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::priority::Priority;

/// Complexity class attached to a task for budget estimation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Complexity {
    pub fn as_str(self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
            Complexity::Critical => "critical",
        }
    }
}

/// The inputs the budget predictor needs about a candidate task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskShape {
    pub task_type: String,
    pub affected_files: u32,
    pub complexity: Complexity,
}

impl TaskShape {
    pub fn new(task_type: impl Into<String>, affected_files: u32, complexity: Complexity) -> Self {
        Self {
            task_type: task_type.into(),
            affected_files,
            complexity,
        }
    }
}

impl Default for TaskShape {
    fn default() -> Self {
        Self::new("default", 1, Complexity::Medium)
    }
}

/// The single unit of work produced by one discovery pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredTask {
    pub priority: Priority,
    /// Identifier of the probe that produced the task.
    pub probe: String,
    pub category: String,
    pub title: String,
    pub description: String,
    /// Command string handed verbatim to the executor.
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Advisory fan-out hint for the executor; the loop never parallelises.
    pub parallel_agents: u32,
    pub task_type: String,
    pub affected_files: u32,
    pub complexity: Complexity,
}

impl DiscoveredTask {
    pub fn shape(&self) -> TaskShape {
        TaskShape::new(self.task_type.clone(), self.affected_files, self.complexity)
    }
}

impl fmt::Display for DiscoveredTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.priority.label(),
            self.category,
            self.title
        )
    }
}

/// State of the orchestration loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Running,
    Paused,
    Completed,
    Failed,
    /// Budget ceiling reached or predicted; resumable after the budget resets.
    ContextCleanup,
}

impl LoopStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopStatus::Running => "running",
            LoopStatus::Paused => "paused",
            LoopStatus::Completed => "completed",
            LoopStatus::Failed => "failed",
            LoopStatus::ContextCleanup => "context_cleanup",
        }
    }

    pub fn is_resumable(self) -> bool {
        matches!(self, LoopStatus::Paused | LoopStatus::ContextCleanup)
    }
}

/// Which validator produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationKind {
    Functional,
    Coverage,
}

/// Outcome of one validator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    pub kind: ValidationKind,
    pub total: u32,
    pub passed_count: u32,
    pub failed_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    /// A pass that carries no evidence, e.g. because the tool is unavailable.
    pub fn vacuous(kind: ValidationKind, reason: impl Into<String>) -> Self {
        Self {
            passed: true,
            kind,
            total: 0,
            passed_count: 0,
            failed_count: 0,
            coverage_percent: None,
            error: Some(reason.into()),
        }
    }

    pub fn failed(kind: ValidationKind, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            kind,
            total: 0,
            passed_count: 0,
            failed_count: 0,
            coverage_percent: None,
            error: Some(reason.into()),
        }
    }
}

/// Status of an entry in the captured todo list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One entry of the todo list captured into checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: u32,
    pub content: String,
    pub status: TodoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<DiscoveredTask>,
}
