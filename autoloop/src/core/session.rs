//! Persisted session records: state, checkpoint and their helpers.
//!
//! Mutators take timestamps from the caller so the types stay deterministic.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{DiscoveredTask, LoopStatus, TodoItem, TodoStatus};

/// Most recent todo entries kept in state and checkpoints.
pub const TODO_HISTORY_LIMIT: usize = 50;
/// Most recent key decisions kept.
pub const DECISION_HISTORY_LIMIT: usize = 100;
/// Most recent touched files kept.
pub const FILES_TOUCHED_LIMIT: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetStats {
    pub current_usage: u8,
    pub peak_usage: u8,
    /// Times the session stopped for a budget cleanup.
    pub cleanup_count: u32,
}

/// Progress counters. They accumulate across resumed invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Tasks handed to the executor. Dry runs are not counted.
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub in_progress: u32,
    pub pending: u32,
}

/// Lifecycle of a planning document under review.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    #[default]
    None,
    Searching,
    Writing,
    Reviewing,
    Approved,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::None => "none",
            ReviewStatus::Searching => "searching",
            ReviewStatus::Writing => "writing",
            ReviewStatus::Reviewing => "reviewing",
            ReviewStatus::Approved => "approved",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentReview {
    pub path: Option<String>,
    pub status: ReviewStatus,
    pub review_result: Option<Value>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl DocumentReview {
    /// Move forward in `none -> searching -> writing -> reviewing -> approved`.
    ///
    /// Backwards moves are rejected; use [`DocumentReview::reset`] to start over.
    pub fn advance(&mut self, status: ReviewStatus, path: Option<String>) -> Result<()> {
        if status < self.status {
            bail!(
                "document review cannot move from {} back to {}",
                self.status.as_str(),
                status.as_str()
            );
        }
        self.status = status;
        if path.is_some() {
            self.path = path;
        }
        Ok(())
    }

    pub fn set_review_result(&mut self, result: Value) {
        self.review_result = Some(result);
    }

    pub fn approve(&mut self, at: DateTime<Utc>) {
        self.status = ReviewStatus::Approved;
        self.approved_at = Some(at);
    }

    pub fn reset(&mut self) {
        *self = DocumentReview::default();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Where a resumed session picks up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub task_id: u32,
    pub task_content: String,
    pub context_hint: String,
    /// Task that was discovered but not executed; dispatched first on resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred_task: Option<DiscoveredTask>,
}

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Pause,
    Interrupt,
    ContextCleanup,
}

impl CheckpointReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointReason::Pause => "pause",
            CheckpointReason::Interrupt => "interrupt",
            CheckpointReason::ContextCleanup => "context_cleanup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub current_phase: String,
    pub progress: Progress,
    pub key_decisions: Vec<String>,
    pub files_touched: Vec<String>,
}

/// The only artifact required to resume a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub created_at: DateTime<Utc>,
    pub session_id: String,
    pub reason: CheckpointReason,
    pub resume_point: ResumePoint,
    pub todo_state: Vec<TodoItem>,
    pub state_snapshot: StateSnapshot,
}

/// Durable record of one orchestration session (`state.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub status: LoopStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Completion marker text for this session, reused on resume.
    pub promise: Option<String>,
    pub current_phase: String,
    /// Iterations run across all invocations (idle iterations included).
    pub iteration: u32,
    pub consecutive_failures: u32,
    pub budget: BudgetStats,
    pub progress: Progress,
    #[serde(default)]
    pub document_review: DocumentReview,
    #[serde(default)]
    pub files_touched: Vec<String>,
    #[serde(default)]
    pub key_decisions: Vec<String>,
    pub last_commit: Option<CommitSummary>,
    pub resume_point: Option<ResumePoint>,
    #[serde(default)]
    pub todos: Vec<TodoItem>,
    /// Set when the latest executed task failed validation.
    #[serde(default)]
    pub last_validation_failed: bool,
    /// Value of `progress.completed` when the last retrospective was dispatched.
    #[serde(default)]
    pub last_retrospective_at: u32,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, promise: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            status: LoopStatus::Running,
            started_at: now,
            last_activity: now,
            promise,
            current_phase: "init".to_string(),
            iteration: 0,
            consecutive_failures: 0,
            budget: BudgetStats::default(),
            progress: Progress::default(),
            document_review: DocumentReview::default(),
            files_touched: Vec::new(),
            key_decisions: Vec::new(),
            last_commit: None,
            resume_point: None,
            todos: Vec::new(),
            last_validation_failed: false,
            last_retrospective_at: 0,
        }
    }

    /// Record a usage reading and track the peak.
    pub fn update_usage(&mut self, percent: u8) {
        let percent = percent.min(100);
        self.budget.current_usage = percent;
        self.budget.peak_usage = self.budget.peak_usage.max(percent);
    }

    /// Returns false if the file was already recorded. Keeps the newest
    /// [`FILES_TOUCHED_LIMIT`] entries.
    pub fn add_file_touched(&mut self, path: impl Into<String>) -> bool {
        push_unique(&mut self.files_touched, path.into(), FILES_TOUCHED_LIMIT)
    }

    /// Returns false if the decision was already recorded. Keeps the newest
    /// [`DECISION_HISTORY_LIMIT`] entries.
    pub fn add_decision(&mut self, decision: impl Into<String>) -> bool {
        push_unique(&mut self.key_decisions, decision.into(), DECISION_HISTORY_LIMIT)
    }

    pub fn set_last_commit(&mut self, message: impl Into<String>, at: DateTime<Utc>) {
        self.last_commit = Some(CommitSummary {
            message: message.into(),
            at,
        });
    }

    /// Append a todo entry for a dispatched task and return its id.
    pub fn push_todo(&mut self, task: &DiscoveredTask) -> u32 {
        let id = self.todos.last().map_or(1, |t| t.id + 1);
        self.todos.push(TodoItem {
            id,
            content: task.title.clone(),
            status: TodoStatus::InProgress,
            task: Some(task.clone()),
        });
        keep_newest(&mut self.todos, TODO_HISTORY_LIMIT);
        id
    }

    /// Drop a todo entry, for a task handed back to the checkpoint.
    pub fn remove_todo(&mut self, id: u32) {
        self.todos.retain(|t| t.id != id);
    }

    pub fn set_todo_status(&mut self, id: u32, status: TodoStatus) {
        if let Some(todo) = self.todos.iter_mut().find(|t| t.id == id) {
            todo.status = status;
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            current_phase: self.current_phase.clone(),
            progress: self.progress.clone(),
            key_decisions: self.key_decisions.clone(),
            files_touched: self.files_touched.clone(),
        }
    }

    /// Build a checkpoint from the current state.
    ///
    /// A deferred task becomes the resume point and is appended to the todo
    /// snapshot as pending.
    pub fn checkpoint(
        &self,
        reason: CheckpointReason,
        deferred: Option<&DiscoveredTask>,
        context_hint: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Checkpoint {
        let mut todo_state = self.todos.clone();
        let resume_point = match deferred {
            Some(task) => {
                let task_id = todo_state.last().map_or(1, |t| t.id + 1);
                todo_state.push(TodoItem {
                    id: task_id,
                    content: task.title.clone(),
                    status: TodoStatus::Pending,
                    task: Some(task.clone()),
                });
                ResumePoint {
                    task_id,
                    task_content: task.command.clone(),
                    context_hint: context_hint.into(),
                    deferred_task: Some(task.clone()),
                }
            }
            None => ResumePoint {
                task_id: todo_state.last().map_or(0, |t| t.id),
                task_content: todo_state
                    .last()
                    .map(|t| t.content.clone())
                    .unwrap_or_default(),
                context_hint: context_hint.into(),
                deferred_task: None,
            },
        };
        Checkpoint {
            created_at: now,
            session_id: self.session_id.clone(),
            reason,
            resume_point,
            todo_state,
            state_snapshot: self.snapshot(),
        }
    }
}

fn push_unique(list: &mut Vec<String>, value: String, limit: usize) -> bool {
    if list.contains(&value) {
        return false;
    }
    list.push(value);
    keep_newest(list, limit);
    true
}

fn keep_newest<T>(list: &mut Vec<T>, limit: usize) {
    if list.len() > limit {
        let excess = list.len() - limit;
        list.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::priority::{Priority, Tier};
    use crate::core::types::Complexity;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn task(title: &str) -> DiscoveredTask {
        DiscoveredTask {
            priority: Priority::new(Tier::Pending, 0),
            probe: "uncommitted-changes".to_string(),
            category: "commit".to_string(),
            title: title.to_string(),
            description: String::new(),
            command: format!("/work '{title}'"),
            details: None,
            parallel_agents: 1,
            task_type: "commit".to_string(),
            affected_files: 2,
            complexity: Complexity::Low,
        }
    }

    #[test]
    fn usage_tracks_peak() {
        let mut state = SessionState::new("s", None, now());
        state.update_usage(70);
        state.update_usage(40);
        assert_eq!(state.budget.current_usage, 40);
        assert_eq!(state.budget.peak_usage, 70);
        state.update_usage(200);
        assert_eq!(state.budget.peak_usage, 100);
    }

    #[test]
    fn files_and_decisions_are_deduplicated() {
        let mut state = SessionState::new("s", None, now());
        assert!(state.add_file_touched("src/lib.rs"));
        assert!(!state.add_file_touched("src/lib.rs"));
        assert!(state.add_decision("use sqlite"));
        assert!(!state.add_decision("use sqlite"));
        assert_eq!(state.files_touched.len(), 1);
        assert_eq!(state.key_decisions.len(), 1);
    }

    #[test]
    fn review_moves_forward_only() {
        let mut review = DocumentReview::default();
        review
            .advance(ReviewStatus::Writing, Some("tasks/prds/0001-prd-x.md".to_string()))
            .expect("forward");
        assert!(review.advance(ReviewStatus::Searching, None).is_err());
        review.approve(now());
        assert_eq!(review.status, ReviewStatus::Approved);
        assert_eq!(review.approved_at, Some(now()));
        assert_eq!(review.path.as_deref(), Some("tasks/prds/0001-prd-x.md"));
    }

    #[test]
    fn checkpoint_with_deferred_task_points_at_it() {
        let mut state = SessionState::new("s", None, now());
        let done = state.push_todo(&task("first"));
        state.set_todo_status(done, TodoStatus::Completed);

        let deferred = task("second");
        let cp = state.checkpoint(CheckpointReason::ContextCleanup, Some(&deferred), "hint", now());
        assert_eq!(cp.resume_point.task_id, 2);
        assert_eq!(cp.resume_point.deferred_task.as_ref(), Some(&deferred));
        assert_eq!(cp.todo_state.len(), 2);
        assert_eq!(cp.todo_state[1].status, TodoStatus::Pending);
        // The live todo list is not modified by taking a checkpoint.
        assert_eq!(state.todos.len(), 1);
    }

    #[test]
    fn todo_history_is_bounded() {
        let mut state = SessionState::new("s", None, now());
        for i in 0..(TODO_HISTORY_LIMIT + 5) {
            state.push_todo(&task(&format!("t{i}")));
        }
        assert_eq!(state.todos.len(), TODO_HISTORY_LIMIT);
        assert_eq!(state.todos.last().map(|t| t.id), Some(TODO_HISTORY_LIMIT as u32 + 5));
    }

    #[test]
    fn decision_and_file_histories_are_bounded() {
        let mut state = SessionState::new("s", None, now());
        for i in 0..(DECISION_HISTORY_LIMIT + 3) {
            state.add_decision(format!("decision {i}"));
        }
        for i in 0..(FILES_TOUCHED_LIMIT + 3) {
            state.add_file_touched(format!("src/f{i}.rs"));
        }
        assert_eq!(state.key_decisions.len(), DECISION_HISTORY_LIMIT);
        assert_eq!(state.key_decisions.first().map(String::as_str), Some("decision 3"));
        assert_eq!(state.files_touched.len(), FILES_TOUCHED_LIMIT);
        assert_eq!(
            state.files_touched.last().map(String::as_str),
            Some(format!("src/f{}.rs", FILES_TOUCHED_LIMIT + 2).as_str())
        );
        assert_eq!(state.snapshot().key_decisions.len(), DECISION_HISTORY_LIMIT);
    }
}
