//! Text rendered for the agent and the operator (minijinja templates).

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::session::{Checkpoint, SessionState};
use crate::core::types::{DiscoveredTask, TodoStatus, ValidationResult};

const DEBUG_TEMPLATE: &str = include_str!("prompts/debug.md");
const RESUME_TEMPLATE: &str = include_str!("prompts/resume.md");

#[derive(Debug, Clone, Serialize)]
struct TaskContext<'a> {
    title: &'a str,
    priority: String,
    command: &'a str,
}

impl<'a> TaskContext<'a> {
    fn from_task(task: &'a DiscoveredTask) -> Self {
        Self {
            title: &task.title,
            priority: task.priority.label(),
            command: &task.command,
        }
    }
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("debug", DEBUG_TEMPLATE)
            .context("load debug template")?;
        env.add_template("resume", RESUME_TEMPLATE)
            .context("load resume template")?;
        Ok(Self { env })
    }
}

/// Synthesize the debug-escalation command for a failed validation.
pub fn render_debug_prompt(task: &DiscoveredTask, results: &[ValidationResult]) -> Result<String> {
    let engine = PromptEngine::new()?;
    let template = engine.env.get_template("debug")?;
    let rendered = template
        .render(context! {
            task => TaskContext::from_task(task),
            results => results,
        })
        .context("render debug prompt")?;
    Ok(rendered)
}

/// Markdown summary telling the operator where a resumed session picks up.
pub fn render_resume_summary(state: &SessionState, checkpoint: &Checkpoint) -> Result<String> {
    let engine = PromptEngine::new()?;
    let template = engine.env.get_template("resume")?;
    let resume = &checkpoint.resume_point;
    let open_todos: Vec<&str> = checkpoint
        .todo_state
        .iter()
        .filter(|todo| matches!(todo.status, TodoStatus::Pending | TodoStatus::InProgress))
        .map(|todo| todo.content.as_str())
        .collect();
    let rendered = template
        .render(context! {
            session_id => &state.session_id,
            status => state.status.as_str(),
            created_at => checkpoint.created_at.to_rfc3339(),
            reason => checkpoint.reason.as_str(),
            phase => &checkpoint.state_snapshot.current_phase,
            progress => &checkpoint.state_snapshot.progress,
            budget => &state.budget,
            review_path => state.document_review.path.as_deref(),
            review_status => state.document_review.status.as_str(),
            last_commit => state.last_commit.as_ref().map(|c| c.message.as_str()),
            task_id => resume.task_id,
            task_content => (!resume.task_content.is_empty()).then_some(resume.task_content.as_str()),
            deferred => resume.deferred_task.as_ref().map(TaskContext::from_task),
            context_hint => (!resume.context_hint.is_empty()).then_some(resume.context_hint.as_str()),
            decisions => &checkpoint.state_snapshot.key_decisions,
            open_todos => open_todos,
        })
        .context("render resume summary")?;
    Ok(rendered)
}
