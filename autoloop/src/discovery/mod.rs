//! Task discovery: an ordered cascade of read-only probes.
//!
//! Order is priority. The engine sorts probes by `(tier, rank)` once and the
//! first probe that matches produces the iteration's task.

pub mod engine;
pub mod probes;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::priority::Priority;
use crate::core::session::SessionState;
use crate::core::types::{Complexity, DiscoveredTask};
use crate::io::config::DiscoveryConfig;
use crate::io::git::Git;
use crate::io::process::{CommandResult, CommandRunner, CommandSpec};

pub use engine::{DiscoveryEngine, ProbeOutcome, ProbeReport};

/// What probes may know about the running session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionView {
    /// First iteration of a session that has not dispatched anything yet.
    pub fresh: bool,
    pub iteration: u32,
    pub completed: u32,
    pub last_retrospective_at: u32,
    pub last_validation_failed: bool,
    pub last_task: Option<DiscoveredTask>,
}

impl SessionView {
    /// View used outside a session (`autoloop discover`).
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn from_state(state: &SessionState) -> Self {
        Self {
            fresh: state.iteration <= 1 && state.progress.total == 0,
            iteration: state.iteration,
            completed: state.progress.completed,
            last_retrospective_at: state.last_retrospective_at,
            last_validation_failed: state.last_validation_failed,
            last_task: state.todos.iter().rev().find_map(|todo| todo.task.clone()),
        }
    }
}

/// Read-only snapshot handed to every probe.
pub struct Environment<'a> {
    pub root: &'a Path,
    pub config: &'a DiscoveryConfig,
    pub session: &'a SessionView,
    pub runner: &'a dyn CommandRunner,
}

impl<'a> Environment<'a> {
    pub fn git(&self) -> Git<'a> {
        Git::new(self.runner, self.root, self.config.probe_timeout())
    }

    /// Run an argv-style tool command in the project root with the probe timeout.
    pub fn run(&self, argv: &[String]) -> Result<CommandResult> {
        let spec = CommandSpec::from_argv(argv, self.root)?.timeout(self.config.probe_timeout());
        self.runner.run(&spec)
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Read a project file; a missing file is `None`.
    pub fn read_file(&self, relative: &str) -> Result<Option<String>> {
        let path = self.path(relative);
        if !path.is_file() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .with_context(|| format!("read {}", path.display()))
    }
}

/// A single read-only check that may produce a task.
///
/// Implementations must not mutate the project. Errors mean "tool unavailable
/// or failed" and are treated as no match by the engine.
pub trait Probe {
    /// Stable identifier, e.g. `build-broken`.
    fn id(&self) -> &'static str;
    fn priority(&self) -> Priority;
    /// Budget estimation tag for tasks this probe emits.
    fn task_type(&self) -> &'static str;
    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>>;
}

/// Start a task for `probe` with neutral shape defaults.
pub fn new_task(
    probe: &dyn Probe,
    category: &str,
    title: impl Into<String>,
    command: impl Into<String>,
) -> DiscoveredTask {
    DiscoveredTask {
        priority: probe.priority(),
        probe: probe.id().to_string(),
        category: category.to_string(),
        title: title.into(),
        description: String::new(),
        command: command.into(),
        details: None,
        parallel_agents: 1,
        task_type: probe.task_type().to_string(),
        affected_files: 1,
        complexity: Complexity::Medium,
    }
}

/// Shorten to `max` characters, marking the cut with `...`.
pub(crate) fn ellipsize(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}...")
}

/// Fan-out hint for findings spread over `files` files.
pub(crate) fn fan_out(files: usize) -> u32 {
    files.clamp(1, 4) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn session_view_is_fresh_only_before_first_dispatch() {
        let mut state = SessionState::new("s", None, Utc::now());
        state.iteration = 1;
        assert!(SessionView::from_state(&state).fresh);
        state.progress.total = 1;
        assert!(!SessionView::from_state(&state).fresh);
        assert!(!SessionView::detached().fresh);
    }

    #[test]
    fn ellipsize_counts_characters() {
        assert_eq!(ellipsize("short", 10), "short");
        assert_eq!(ellipsize("ééééé", 2), "éé...");
    }
}
