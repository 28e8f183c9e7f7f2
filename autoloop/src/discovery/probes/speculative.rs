//! Tier 5: speculative self-improvement.

use anyhow::Result;
use serde_json::json;

use crate::core::priority::{Priority, Tier};
use crate::core::types::{Complexity, DiscoveredTask};
use crate::discovery::{Environment, Probe, new_task};

/// Retrospective after every `retrospective_interval` completed tasks.
pub struct Retrospective;

impl Probe for Retrospective {
    fn id(&self) -> &'static str {
        "retrospective"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Speculative, 0)
    }

    fn task_type(&self) -> &'static str {
        "prd_analysis"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        let interval = env.config.retrospective_interval;
        let session = env.session;
        let since = session.completed.saturating_sub(session.last_retrospective_at);
        if interval == 0 || since < interval {
            return Ok(None);
        }
        let mut task = new_task(
            self,
            "retrospective",
            format!("Retrospective over the last {since} tasks"),
            "/research review 'session retrospective: what worked, what to change'",
        );
        task.description = format!("{} tasks completed this session", session.completed);
        task.complexity = Complexity::Low;
        task.details = Some(json!({ "completed": session.completed, "since_last": since }));
        Ok(Some(task))
    }
}

/// Look for a different approach after the previous task failed validation.
pub struct AlternativeSolution;

impl Probe for AlternativeSolution {
    fn id(&self) -> &'static str {
        "alternative-solution"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Speculative, 1)
    }

    fn task_type(&self) -> &'static str {
        "solution_search"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        if !env.session.last_validation_failed {
            return Ok(None);
        }
        let Some(previous) = &env.session.last_task else {
            return Ok(None);
        };
        let mut task = new_task(
            self,
            "alternative",
            format!("Find another approach: {}", previous.title),
            format!("/research 'alternative approach for: {}'", previous.title),
        );
        task.description = "The previous attempt failed validation".to_string();
        task.affected_files = previous.affected_files;
        task.details = Some(json!({ "previous_command": previous.command }));
        Ok(Some(task))
    }
}
