//! CLI command implementations.
//!
//! Each command returns the process exit code (see [`crate::exit_codes`]);
//! `Err` is reserved for failures, mapped by [`exit_code_for_error`].

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::core::session::SessionState;
use crate::core::types::{DiscoveredTask, LoopStatus};
use crate::discovery::{DiscoveryEngine, Environment, ProbeOutcome, SessionView};
use crate::exit_codes;
use crate::io::config::{AutoConfig, load_config};
use crate::io::control::{ControlChannel, RequestedSignal, SignalHandler, clear_control, write_control};
use crate::io::executor::AgentExecutor;
use crate::io::paths::{AutoPaths, InitOptions, init_workspace};
use crate::io::process::ProcessRunner;
use crate::io::prompt::render_resume_summary;
use crate::io::session_store::{SessionNotFoundError, SessionStore, StateCorruptError};
use crate::io::usage::{FileUsageSource, write_usage};
use crate::orchestrator::{LoopDeps, Orchestrator, RunOptions};
use crate::validation::CommandValidator;

/// The request itself is unusable (bad flag value, wrong session state, bad config).
#[derive(Debug)]
pub struct InvalidInputError {
    pub message: String,
}

impl InvalidInputError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for InvalidInputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for InvalidInputError {}

/// Map a command error to its exit code.
pub fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    let invalid = err.chain().any(|cause| {
        cause.is::<InvalidInputError>()
            || cause.is::<StateCorruptError>()
            || cause.is::<SessionNotFoundError>()
    });
    if invalid {
        exit_codes::INVALID
    } else {
        exit_codes::FAILED
    }
}

/// Flags shared by `run` and `resume`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopArgs {
    pub max: Option<u32>,
    pub promise: Option<String>,
    pub dry_run: bool,
    pub skip_validation: bool,
}

impl LoopArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            max_iterations: self.max,
            dry_run: self.dry_run,
            skip_validation: self.skip_validation,
        }
    }
}

struct Workspace {
    store: SessionStore,
    config: AutoConfig,
}

fn open(root: &Path) -> Result<Workspace> {
    let paths = AutoPaths::new(root);
    let config = load_config(&paths.config_path)
        .map_err(|err| InvalidInputError::new(format!("{err:#}")))?;
    Ok(Workspace {
        store: SessionStore::new(paths),
        config,
    })
}

/// `autoloop run`: start a new session.
pub fn cmd_run(root: &Path, args: &LoopArgs) -> Result<i32> {
    let ws = open(root)?;
    let state = ws.store.create(args.promise.clone())?;
    println!("Session {} started", state.session_id);
    run_session(&ws, state, args, None)
}

/// `autoloop resume [ID]`: continue a paused, cleaned-up or interrupted session.
pub fn cmd_resume(root: &Path, session_id: Option<&str>, args: &LoopArgs) -> Result<i32> {
    let ws = open(root)?;
    let mut state = match session_id {
        Some(id) if ws.store.is_archived(id) => ws.store.restore(id)?,
        Some(id) => ws.store.load(id)?,
        None => ws
            .store
            .latest_resumable()?
            .ok_or_else(|| InvalidInputError::new("no resumable session found"))?,
    };
    if state.status == LoopStatus::Failed {
        return Err(InvalidInputError::new(format!(
            "session {} failed; start a new one with `autoloop run`",
            state.session_id
        ))
        .into());
    }

    let paths = ws.store.session_paths(&state.session_id);
    clear_control(&paths.control_path)?;
    if let Some(promise) = &args.promise {
        state.promise = Some(promise.clone());
    }
    let checkpoint = ws.store.load_checkpoint(&state.session_id)?;
    if let Some(checkpoint) = &checkpoint {
        println!("{}", render_resume_summary(&state, checkpoint)?);
    }
    let deferred = checkpoint.and_then(|checkpoint| checkpoint.resume_point.deferred_task);
    info!(
        session_id = %state.session_id,
        deferred = deferred.is_some(),
        "resuming session"
    );
    run_session(&ws, state, args, deferred)
}

fn run_session(
    ws: &Workspace,
    mut state: SessionState,
    args: &LoopArgs,
    deferred: Option<DiscoveredTask>,
) -> Result<i32> {
    let root = ws.store.paths().root.clone();
    let handler = SignalHandler::new();
    if let Err(err) = handler.install_ctrlc() {
        warn!(error = %format!("{err:#}"), "Ctrl-C will not checkpoint");
    }
    let control = ControlChannel::new(
        handler,
        ws.store.session_paths(&state.session_id).control_path,
    );
    let runner = ProcessRunner;
    let executor = AgentExecutor::new(ws.config.executor.command.clone(), ProcessRunner);
    let validator = CommandValidator::new(&runner, &root, &ws.config.validation);
    let usage = FileUsageSource::new(ws.store.paths().resolve(&ws.config.budget.usage_file));
    let engine = DiscoveryEngine::standard();
    let deps = LoopDeps {
        engine: &engine,
        runner: &runner,
        executor: &executor,
        validator: &validator,
        usage: &usage,
        control: &control,
    };

    let summary = Orchestrator::new(&ws.store, &ws.config, deps).run(
        &mut state,
        &args.options(),
        deferred,
    )?;
    println!("{}", summary.render());
    Ok(exit_codes::for_status(summary.status))
}

fn resolve_session(store: &SessionStore, session_id: Option<&str>) -> Result<Option<SessionState>> {
    match session_id {
        Some(id) if store.is_archived(id) => store.load_archived(id).map(Some),
        Some(id) => store.load(id).map(Some),
        None => store.latest_resumable(),
    }
}

/// `autoloop status [ID]`.
pub fn cmd_status(root: &Path, session_id: Option<&str>) -> Result<i32> {
    let ws = open(root)?;
    let Some(state) = resolve_session(&ws.store, session_id)? else {
        println!("No active session.");
        return Ok(exit_codes::OK);
    };
    print!("{}", render_status(&state, &ws.config));
    Ok(exit_codes::OK)
}

fn render_status(state: &SessionState, config: &AutoConfig) -> String {
    let level = config.budget.thresholds().level(state.budget.current_usage);
    let p = &state.progress;
    let mut out = format!(
        "Session:    {}\nStatus:     {}\nPhase:      {}\nIteration:  {}\n",
        state.session_id,
        state.status.as_str(),
        state.current_phase,
        state.iteration
    );
    out.push_str(&format!(
        "Progress:   {} total, {} completed, {} failed, {} pending\n",
        p.total, p.completed, p.failed, p.pending
    ));
    out.push_str(&format!(
        "Budget:     {}% ({}), peak {}%, cleanups {}\n",
        state.budget.current_usage,
        level.as_str(),
        state.budget.peak_usage,
        state.budget.cleanup_count
    ));
    out.push_str(&format!("Failures:   {} consecutive\n", state.consecutive_failures));
    out.push_str(&format!("Files:      {} touched\n", state.files_touched.len()));
    if let Some(commit) = &state.last_commit {
        out.push_str(&format!("Last commit: {}\n", commit.message));
    }
    if let Some(promise) = &state.promise {
        out.push_str(&format!("Promise:    {promise}\n"));
    }
    if let Some(resume) = &state.resume_point {
        out.push_str(&format!(
            "Resume at:  #{} {} ({})\n",
            resume.task_id, resume.task_content, resume.context_hint
        ));
    }
    out
}

/// `autoloop discover [--report]`: run the cascade once without a session.
pub fn cmd_discover(root: &Path, report: bool) -> Result<i32> {
    let ws = open(root)?;
    let engine = DiscoveryEngine::standard();
    let runner = ProcessRunner;
    let session = SessionView::detached();
    let env = Environment {
        root,
        config: &ws.config.discovery,
        session: &session,
        runner: &runner,
    };

    if report {
        let mut current_tier = None;
        for entry in engine.report(&env) {
            if current_tier != Some(entry.priority.tier) {
                current_tier = Some(entry.priority.tier);
                println!("Tier {} ({})", entry.priority.tier.index(), entry.priority.tier.as_str());
            }
            let line = match &entry.outcome {
                ProbeOutcome::Match(task) => format!("match: {}", task.title),
                ProbeOutcome::NoMatch => "no match".to_string(),
                ProbeOutcome::Error(message) => format!("unavailable: {message}"),
                ProbeOutcome::Disabled => "disabled".to_string(),
            };
            println!("  {} {:<24} {line}", entry.priority.label(), entry.id);
        }
        return Ok(exit_codes::OK);
    }

    match engine.discover_next_task(&env) {
        Some(task) => {
            println!("{task}");
            if !task.description.is_empty() {
                println!("  {}", task.description);
            }
            println!("  command: {}", task.command);
            println!(
                "  type: {}, files: {}, complexity: {}, agents: {}",
                task.task_type,
                task.affected_files,
                task.complexity.as_str(),
                task.parallel_agents
            );
        }
        None => println!("Nothing to do right now."),
    }
    Ok(exit_codes::OK)
}

fn require_session(store: &SessionStore, session_id: Option<&str>) -> Result<SessionState> {
    match session_id {
        Some(id) => store.load(id),
        None => store
            .latest_resumable()?
            .ok_or_else(|| InvalidInputError::new("no active session found").into()),
    }
}

/// `autoloop pause [ID]`: ask a running loop to checkpoint and stop.
pub fn cmd_pause(root: &Path, session_id: Option<&str>) -> Result<i32> {
    let ws = open(root)?;
    let state = require_session(&ws.store, session_id)?;
    if state.status != LoopStatus::Running {
        return Err(InvalidInputError::new(format!(
            "session {} is not running (status: {})",
            state.session_id,
            state.status.as_str()
        ))
        .into());
    }
    let path = ws.store.session_paths(&state.session_id).control_path;
    write_control(&path, RequestedSignal::Pause)?;
    println!(
        "Pause requested for {}; the loop stops after the current step.",
        state.session_id
    );
    Ok(exit_codes::OK)
}

/// `autoloop abort [ID]`: stop without a checkpoint.
///
/// A running loop is signalled; any other non-terminal session is marked
/// failed directly.
pub fn cmd_abort(root: &Path, session_id: Option<&str>) -> Result<i32> {
    let ws = open(root)?;
    let mut state = require_session(&ws.store, session_id)?;
    match state.status {
        LoopStatus::Running => {
            let path = ws.store.session_paths(&state.session_id).control_path;
            write_control(&path, RequestedSignal::Abort)?;
            println!("Abort requested for {}.", state.session_id);
        }
        LoopStatus::Paused | LoopStatus::ContextCleanup => {
            state.status = LoopStatus::Failed;
            ws.store.save(&mut state)?;
            println!("Session {} marked failed.", state.session_id);
        }
        LoopStatus::Completed | LoopStatus::Failed => {
            println!(
                "Session {} already {}.",
                state.session_id,
                state.status.as_str()
            );
        }
    }
    Ok(exit_codes::OK)
}

/// `autoloop report-usage <PERCENT>`: record the externally measured usage.
pub fn cmd_report_usage(root: &Path, percent: f64) -> Result<i32> {
    let ws = open(root)?;
    let path = ws.store.paths().resolve(&ws.config.budget.usage_file);
    write_usage(&path, percent).map_err(|err| InvalidInputError::new(format!("{err:#}")))?;
    let rounded = percent.round().clamp(0.0, 100.0) as u8;
    let level = ws.config.budget.thresholds().level(rounded);
    println!("Usage {percent}% recorded ({})", level.as_str());
    Ok(exit_codes::OK)
}

/// `autoloop init [--force]`.
pub fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })
        .with_context(|| format!("initialize {}", root.display()))?;
    println!("Initialized {}", paths.auto_dir.display());
    Ok(exit_codes::OK)
}
