//! The orchestration loop: discover, budget-check, dispatch, validate, persist.
//!
//! One iteration at a time, single writer. Every iteration ends with an
//! atomic `state.json` write; control requests are polled between steps,
//! never mid-write.
//!
//! Termination predicates are evaluated in a fixed order before each
//! iteration: iteration limit, consecutive-failure ceiling, critical usage.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::should_cleanup;
use crate::core::marker::contains_promise;
use crate::core::session::{CheckpointReason, SessionState};
use crate::core::types::{DiscoveredTask, LoopStatus, TodoStatus};
use crate::discovery::{DiscoveryEngine, Environment, SessionView};
use crate::io::audit_log::{AuditLog, EventKind};
use crate::io::config::AutoConfig;
use crate::io::control::{ControlChannel, ControlSignal};
use crate::io::executor::{ExecOutput, ExecRequest, Executor};
use crate::io::git::Git;
use crate::io::iteration_log::{IterationMeta, IterationOutcome, IterationPaths, write_iteration};
use crate::io::process::CommandRunner;
use crate::io::session_store::SessionStore;
use crate::io::usage::UsageSource;
use crate::validation::{DebugTarget, ValidationReport, ValidationSubsystem, Validator};

/// Granularity of interruptible sleeps.
const POLL_SLICE: Duration = Duration::from_millis(200);

/// Per-invocation options (CLI flags).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Iterations allowed in this invocation; `None` runs until another stop.
    pub max_iterations: Option<u32>,
    pub dry_run: bool,
    pub skip_validation: bool,
}

/// Collaborators the loop drives.
pub struct LoopDeps<'a> {
    pub engine: &'a DiscoveryEngine,
    /// Used by probes and for git bookkeeping.
    pub runner: &'a dyn CommandRunner,
    pub executor: &'a dyn Executor,
    pub validator: &'a dyn Validator,
    pub usage: &'a dyn UsageSource,
    pub control: &'a ControlChannel,
}

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    MaxIterations { max: u32 },
    PromiseFulfilled,
    ConsecutiveFailures { failures: u32 },
    CriticalUsage { usage: u8 },
    /// The next task was predicted not to fit; it is deferred to the checkpoint.
    BudgetCleanup { usage: u8, estimate: u32 },
    Paused,
    Interrupted,
    Aborted,
}

impl StopReason {
    pub fn status(&self) -> LoopStatus {
        match self {
            StopReason::MaxIterations { .. } | StopReason::PromiseFulfilled => LoopStatus::Completed,
            StopReason::ConsecutiveFailures { .. } | StopReason::Aborted => LoopStatus::Failed,
            StopReason::CriticalUsage { .. } | StopReason::BudgetCleanup { .. } => {
                LoopStatus::ContextCleanup
            }
            StopReason::Paused | StopReason::Interrupted => LoopStatus::Paused,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            StopReason::MaxIterations { max } => format!("iteration limit reached ({max})"),
            StopReason::PromiseFulfilled => "completion marker found".to_string(),
            StopReason::ConsecutiveFailures { failures } => {
                format!("{failures} consecutive failed iterations")
            }
            StopReason::CriticalUsage { usage } => {
                format!("context usage at {usage}% reached the critical threshold")
            }
            StopReason::BudgetCleanup { usage, estimate } => format!(
                "next task needs ~{estimate}% with usage at {usage}%; cleanup before continuing"
            ),
            StopReason::Paused => "pause requested".to_string(),
            StopReason::Interrupted => "interrupted".to_string(),
            StopReason::Aborted => "abort requested".to_string(),
        }
    }

    fn is_control(&self) -> bool {
        matches!(
            self,
            StopReason::Paused | StopReason::Interrupted | StopReason::Aborted
        )
    }

    fn checkpoint_reason(&self) -> CheckpointReason {
        match self {
            StopReason::Paused => CheckpointReason::Pause,
            StopReason::Interrupted => CheckpointReason::Interrupt,
            _ => CheckpointReason::ContextCleanup,
        }
    }
}

/// Iteration counts for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IterationTally {
    pub iterations: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub idle: u32,
    pub dry_run: u32,
}

/// Result of one `run`/`resume` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub session_id: String,
    pub status: LoopStatus,
    pub stop: StopReason,
    pub tally: IterationTally,
    /// Session-wide totals after this invocation.
    pub completed_total: u32,
    pub failed_total: u32,
    pub checkpoint_path: Option<PathBuf>,
    pub archive_path: Option<PathBuf>,
}

impl RunSummary {
    /// Operator-facing termination summary, including resume instructions.
    pub fn render(&self) -> String {
        let t = &self.tally;
        let mut lines = vec![
            format!(
                "Session {} stopped: {} ({})",
                self.session_id,
                self.status.as_str(),
                self.stop.describe()
            ),
            format!(
                "Iterations: {} (succeeded {}, failed {}, idle {}, dry-run {})",
                t.iterations, t.succeeded, t.failed, t.idle, t.dry_run
            ),
            format!(
                "Session totals: {} completed, {} failed",
                self.completed_total, self.failed_total
            ),
        ];
        if let Some(path) = &self.checkpoint_path {
            lines.push(format!("Checkpoint: {}", path.display()));
        }
        if let Some(path) = &self.archive_path {
            lines.push(format!("Archived to: {}", path.display()));
        }
        match self.status {
            LoopStatus::Paused => {
                lines.push(format!("Resume with: autoloop resume {}", self.session_id));
            }
            LoopStatus::ContextCleanup => {
                lines.push(
                    "Clear the agent context, report the new usage with `autoloop report-usage <PERCENT>`,"
                        .to_string(),
                );
                lines.push(format!("then resume with: autoloop resume {}", self.session_id));
            }
            _ => {}
        }
        lines.join("\n")
    }
}

enum Step {
    /// Keep running after resting for the given duration.
    Rest(Duration),
    Stop(StopReason, Option<DiscoveredTask>),
}

/// Drives one session until a stop condition.
pub struct Orchestrator<'a> {
    store: &'a SessionStore,
    config: &'a AutoConfig,
    deps: LoopDeps<'a>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(store: &'a SessionStore, config: &'a AutoConfig, deps: LoopDeps<'a>) -> Self {
        Self {
            store,
            config,
            deps,
        }
    }

    fn root(&self) -> &Path {
        &self.store.paths().root
    }

    /// Run the loop for `state`, dispatching `deferred` first when given.
    ///
    /// Loop-level errors mark the session `failed`, leaving the last
    /// successfully written state otherwise intact, and are returned.
    #[instrument(skip_all, fields(session_id = %state.session_id))]
    pub fn run(
        &self,
        state: &mut SessionState,
        options: &RunOptions,
        deferred: Option<DiscoveredTask>,
    ) -> Result<RunSummary> {
        let audit = AuditLog::new(self.store.session_paths(&state.session_id).events_path);
        match self.drive(state, options, deferred, &audit) {
            Ok(summary) => Ok(summary),
            Err(err) => {
                error!(error = %format!("{err:#}"), "loop failed");
                if let Err(log_err) = audit.record(
                    EventKind::Error,
                    &state.current_phase,
                    json!({ "error": format!("{err:#}") }),
                ) {
                    warn!(error = %format!("{log_err:#}"), "could not record loop error");
                }
                self.mark_failed(&state.session_id);
                state.status = LoopStatus::Failed;
                Err(err)
            }
        }
    }

    fn mark_failed(&self, session_id: &str) {
        match self.store.load(session_id) {
            Ok(mut last) => {
                last.status = LoopStatus::Failed;
                if let Err(err) = self.store.save(&mut last) {
                    warn!(error = %format!("{err:#}"), "could not mark session failed");
                }
            }
            Err(err) => warn!(error = %format!("{err:#}"), "could not reload session"),
        }
    }

    fn drive(
        &self,
        state: &mut SessionState,
        options: &RunOptions,
        deferred: Option<DiscoveredTask>,
        audit: &AuditLog,
    ) -> Result<RunSummary> {
        let mut deferred = deferred;
        state.status = LoopStatus::Running;
        self.store.save(state)?;
        audit.record(
            EventKind::Action,
            "loop",
            json!({
                "event": "start",
                "max_iterations": options.max_iterations,
                "dry_run": options.dry_run,
                "skip_validation": options.skip_validation,
                "deferred": deferred.as_ref().map(|task| task.title.clone()),
            }),
        )?;
        info!(
            max_iterations = ?options.max_iterations,
            dry_run = options.dry_run,
            "loop started"
        );

        let mut tally = IterationTally::default();
        let (stop, pending) = loop {
            if let Some(stop) = self.control_stop() {
                break (stop, deferred.take());
            }
            self.refresh_usage(state);
            if let Some(stop) = self.termination(state, options, &tally) {
                break (stop, deferred.take());
            }
            match self.iterate(state, options, deferred.take(), audit, &mut tally)? {
                Step::Rest(duration) => {
                    if self.termination(state, options, &tally).is_none() {
                        self.rest(duration);
                    }
                }
                Step::Stop(stop, pending) => break (stop, pending),
            }
        };
        self.finish(state, stop, pending, tally, audit)
    }

    fn control_stop(&self) -> Option<StopReason> {
        match self.deps.control.poll() {
            ControlSignal::None => None,
            ControlSignal::Pause => Some(StopReason::Paused),
            ControlSignal::Interrupt => Some(StopReason::Interrupted),
            ControlSignal::Abort => Some(StopReason::Aborted),
        }
    }

    fn refresh_usage(&self, state: &mut SessionState) {
        match self.deps.usage.current_usage() {
            Ok(Some(usage)) => state.update_usage(usage),
            Ok(None) => {}
            Err(err) => warn!(error = %format!("{err:#}"), "usage report unreadable; keeping last value"),
        }
    }

    fn termination(
        &self,
        state: &SessionState,
        options: &RunOptions,
        tally: &IterationTally,
    ) -> Option<StopReason> {
        if let Some(max) = options.max_iterations
            && tally.iterations >= max
        {
            return Some(StopReason::MaxIterations { max });
        }
        let ceiling = self.config.looping.max_consecutive_failures;
        if state.consecutive_failures >= ceiling {
            return Some(StopReason::ConsecutiveFailures {
                failures: state.consecutive_failures,
            });
        }
        let usage = state.budget.current_usage;
        if usage >= self.config.budget.critical_threshold {
            return Some(StopReason::CriticalUsage { usage });
        }
        None
    }

    /// Sleep up to `duration`, returning early once a control signal appears.
    fn rest(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while self.deps.control.poll() == ControlSignal::None {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(POLL_SLICE));
        }
    }

    fn discover(&self, state: &SessionState) -> Option<DiscoveredTask> {
        let view = SessionView::from_state(state);
        let env = Environment {
            root: self.root(),
            config: &self.config.discovery,
            session: &view,
            runner: self.deps.runner,
        };
        self.deps.engine.discover_next_task(&env)
    }

    fn iterate(
        &self,
        state: &mut SessionState,
        options: &RunOptions,
        deferred: Option<DiscoveredTask>,
        audit: &AuditLog,
        tally: &mut IterationTally,
    ) -> Result<Step> {
        state.iteration += 1;
        tally.iterations += 1;
        let mut record = IterationRecord::start(state);
        let paths = IterationPaths::new(
            &self.store.session_paths(&state.session_id).iterations_dir,
            record.iteration,
        );
        let output_limit = self.config.looping.output_limit_bytes;

        let resumed = deferred.is_some();
        let Some(task) = deferred.or_else(|| self.discover(state)) else {
            tally.idle += 1;
            let backoff = self.config.looping.idle_backoff();
            info!(iteration = record.iteration, "nothing to do; backing off");
            println!(
                "[{}] idle: nothing to do, checking again in {}s",
                record.iteration,
                backoff.as_secs()
            );
            write_iteration(&paths, &record.finish(IterationOutcome::Idle, None), None, output_limit)?;
            self.store.save(state)?;
            return Ok(Step::Rest(backoff));
        };
        record.task(&task);
        audit.record(
            EventKind::Decision,
            &task.category,
            json!({
                "iteration": record.iteration,
                "probe": task.probe,
                "priority": task.priority.label(),
                "title": task.title,
                "resumed": resumed,
            }),
        )?;

        if let Some(stop) = self.control_stop() {
            write_iteration(&paths, &record.finish(IterationOutcome::Deferred, None), None, output_limit)?;
            self.store.save(state)?;
            return Ok(Step::Stop(stop, Some(task)));
        }

        let usage = state.budget.current_usage;
        if usage >= self.config.budget.prepare_threshold {
            let (cleanup, estimate) =
                should_cleanup(usage, &task.shape(), self.config.budget.comfort_margin);
            audit.record(
                EventKind::Decision,
                "budget",
                json!({
                    "usage": usage,
                    "estimate": estimate.adjusted_estimate,
                    "remaining": estimate.remaining,
                    "cleanup": cleanup,
                    "recommendation": estimate.recommendation,
                }),
            )?;
            if cleanup {
                info!(usage, estimate = estimate.adjusted_estimate, "deferring task for cleanup");
                state.add_decision(format!(
                    "deferred '{}' at {usage}% usage (estimate {}%)",
                    task.title, estimate.adjusted_estimate
                ));
                write_iteration(&paths, &record.finish(IterationOutcome::Deferred, None), None, output_limit)?;
                self.store.save(state)?;
                return Ok(Step::Stop(
                    StopReason::BudgetCleanup {
                        usage,
                        estimate: estimate.adjusted_estimate,
                    },
                    Some(task),
                ));
            }
        }

        println!("[{}] {}", record.iteration, task);
        if options.dry_run {
            tally.dry_run += 1;
            info!(command = %task.command, "dry run; executor not invoked");
            println!("    would run: {}", task.command);
            audit.record(
                EventKind::Action,
                &task.category,
                json!({ "dry_run": true, "command": task.command }),
            )?;
            write_iteration(&paths, &record.finish(IterationOutcome::DryRun, None), None, output_limit)?;
            self.store.save(state)?;
            return Ok(Step::Rest(self.config.looping.cooldown()));
        }

        if task.probe == "retrospective" {
            state.last_retrospective_at = state.progress.completed;
        }
        state.current_phase = task.category.clone();
        state.progress.total += 1;
        state.progress.in_progress = 1;
        let todo_id = state.push_todo(&task);
        if resumed {
            self.store.clear_checkpoint(state)?;
        } else {
            self.store.save(state)?;
        }

        let exec = self.execute(&task, &paths, audit)?;
        record.exec(&exec);
        if !exec.success && self.deps.control.poll() == ControlSignal::Interrupt {
            info!(task = %task.title, "agent interrupted; deferring task");
            state.remove_todo(todo_id);
            state.progress.total = state.progress.total.saturating_sub(1);
            state.progress.in_progress = 0;
            state.add_decision(format!("interrupted '{}' mid-run; deferred", task.title));
            let meta = record.finish(IterationOutcome::Deferred, Some(state.budget.current_usage));
            write_iteration(&paths, &meta, Some(&exec.output), output_limit)?;
            self.store.save(state)?;
            return Ok(Step::Stop(StopReason::Interrupted, Some(task)));
        }
        let promise_found = state
            .promise
            .as_deref()
            .is_some_and(|promise| contains_promise(&exec.output, promise));
        record.promise_found = promise_found;

        let validation = if exec.success && !options.skip_validation {
            let report = self.validate(&task);
            audit.record(EventKind::Validation, &task.category, serde_json::to_value(&report)?)?;
            Some(report)
        } else {
            None
        };
        let validation_failed = validation.as_ref().is_some_and(|report| !report.passed);
        if let Some(report) = validation {
            record.validation = report.results;
        }

        let succeeded = exec.success && !validation_failed;
        state.last_validation_failed = validation_failed;
        state.progress.in_progress = 0;
        let outcome = if succeeded {
            state.progress.completed += 1;
            state.consecutive_failures = 0;
            state.set_todo_status(todo_id, TodoStatus::Completed);
            tally.succeeded += 1;
            IterationOutcome::Succeeded
        } else {
            state.progress.failed += 1;
            state.consecutive_failures += 1;
            state.set_todo_status(todo_id, TodoStatus::Failed);
            tally.failed += 1;
            if validation_failed {
                state.add_decision(format!("validation failed after '{}'", task.title));
                IterationOutcome::ValidationFailed
            } else {
                IterationOutcome::Failed
            }
        };
        self.record_changes(state);

        let meta = record.finish(outcome, Some(state.budget.current_usage));
        write_iteration(&paths, &meta, Some(&exec.output), output_limit)?;
        self.store.save(state)?;
        println!(
            "[{}] {:?} in {}ms (consecutive failures: {})",
            meta.iteration, outcome, meta.duration_ms, state.consecutive_failures
        );

        if promise_found {
            info!("completion marker found");
            return Ok(Step::Stop(StopReason::PromiseFulfilled, None));
        }
        Ok(Step::Rest(self.config.looping.cooldown()))
    }

    fn execute(
        &self,
        task: &DiscoveredTask,
        paths: &IterationPaths,
        audit: &AuditLog,
    ) -> Result<ExecOutput> {
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;
        let request = ExecRequest {
            workdir: self.root().to_path_buf(),
            command: task.command.clone(),
            timeout: self.config.looping.executor_timeout(),
            output_limit_bytes: self.config.looping.output_limit_bytes,
            stream_path: Some(paths.dir.join("stream.log")),
            cancel: Some(self.deps.control.handler().clone()),
        };
        let exec = match self.deps.executor.exec(&request) {
            Ok(exec) => exec,
            Err(err) => {
                let message = format!("{err:#}");
                warn!(error = %message, "executor could not be started");
                audit.record(EventKind::Error, &task.category, json!({ "executor": message }))?;
                ExecOutput {
                    output: message,
                    success: false,
                    timed_out: false,
                    exit_code: None,
                }
            }
        };
        audit.record(
            EventKind::Action,
            &task.category,
            json!({
                "command": task.command,
                "success": exec.success,
                "exit_code": exec.exit_code,
                "timed_out": exec.timed_out,
            }),
        )?;
        Ok(exec)
    }

    fn validate(&self, task: &DiscoveredTask) -> ValidationReport {
        let subsystem = ValidationSubsystem::new(
            self.deps.validator,
            DebugTarget {
                executor: self.deps.executor,
                workdir: self.root(),
                timeout: self.config.looping.executor_timeout(),
                output_limit_bytes: self.config.looping.output_limit_bytes,
            },
        );
        subsystem.validate(task)
    }

    /// Best-effort git bookkeeping: touched files and the latest commit.
    fn record_changes(&self, state: &mut SessionState) {
        let git = Git::new(
            self.deps.runner,
            self.root(),
            self.config.discovery.probe_timeout(),
        );
        match git.status_porcelain() {
            Ok(entries) => {
                for entry in entries.iter().filter(|entry| entry.is_tracked_change()) {
                    state.add_file_touched(entry.path.clone());
                }
            }
            Err(err) => debug!(error = %format!("{err:#}"), "git status unavailable"),
        }
        match git.last_commit_subject() {
            Ok(Some(subject)) => {
                let known = state
                    .last_commit
                    .as_ref()
                    .is_some_and(|commit| commit.message == subject);
                if !known {
                    state.set_last_commit(subject, Utc::now());
                }
            }
            Ok(None) => {}
            Err(err) => debug!(error = %format!("{err:#}"), "git log unavailable"),
        }
    }

    fn finish(
        &self,
        state: &mut SessionState,
        stop: StopReason,
        pending: Option<DiscoveredTask>,
        tally: IterationTally,
        audit: &AuditLog,
    ) -> Result<RunSummary> {
        let status = stop.status();
        state.status = status;
        state.progress.in_progress = 0;
        state.progress.pending = u32::from(pending.is_some());
        if stop.is_control() {
            self.deps.control.acknowledge()?;
        }
        audit.record(
            EventKind::Action,
            "loop",
            json!({ "event": "stop", "status": status.as_str(), "stop": stop, "tally": tally }),
        )?;
        info!(status = status.as_str(), reason = %stop.describe(), "loop stopped");

        let mut checkpoint_path = None;
        let mut archive_path = None;
        match status {
            LoopStatus::Paused | LoopStatus::ContextCleanup => {
                if status == LoopStatus::ContextCleanup {
                    state.budget.cleanup_count += 1;
                }
                let checkpoint = state.checkpoint(
                    stop.checkpoint_reason(),
                    pending.as_ref(),
                    stop.describe(),
                    Utc::now(),
                );
                audit.record(
                    EventKind::Checkpoint,
                    "loop",
                    json!({
                        "reason": checkpoint.reason.as_str(),
                        "task_id": checkpoint.resume_point.task_id,
                        "deferred": pending.as_ref().map(|task| task.title.clone()),
                    }),
                )?;
                self.store.write_checkpoint(state, &checkpoint)?;
                checkpoint_path = Some(self.store.session_paths(&state.session_id).checkpoint_path);
            }
            LoopStatus::Completed => {
                self.store.clear_checkpoint(state)?;
                archive_path = Some(self.store.archive(&state.session_id)?);
            }
            LoopStatus::Failed | LoopStatus::Running => {
                self.store.save(state)?;
            }
        }

        Ok(RunSummary {
            session_id: state.session_id.clone(),
            status,
            stop,
            tally,
            completed_total: state.progress.completed,
            failed_total: state.progress.failed,
            checkpoint_path,
            archive_path,
        })
    }
}

/// Accumulates one iteration's `meta.json`.
struct IterationRecord {
    session_id: String,
    iteration: u32,
    usage: u8,
    started_at: DateTime<Utc>,
    clock: Instant,
    probe: Option<String>,
    priority: Option<String>,
    title: Option<String>,
    command: Option<String>,
    exit_code: Option<i32>,
    timed_out: bool,
    promise_found: bool,
    validation: Vec<crate::core::types::ValidationResult>,
}

impl IterationRecord {
    fn start(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            iteration: state.iteration,
            usage: state.budget.current_usage,
            started_at: Utc::now(),
            clock: Instant::now(),
            probe: None,
            priority: None,
            title: None,
            command: None,
            exit_code: None,
            timed_out: false,
            promise_found: false,
            validation: Vec::new(),
        }
    }

    fn task(&mut self, task: &DiscoveredTask) {
        self.probe = Some(task.probe.clone());
        self.priority = Some(task.priority.label());
        self.title = Some(task.title.clone());
        self.command = Some(task.command.clone());
    }

    fn exec(&mut self, exec: &ExecOutput) {
        self.exit_code = exec.exit_code;
        self.timed_out = exec.timed_out;
    }

    fn finish(&self, outcome: IterationOutcome, usage: Option<u8>) -> IterationMeta {
        IterationMeta {
            session_id: self.session_id.clone(),
            iteration: self.iteration,
            outcome,
            probe: self.probe.clone(),
            priority: self.priority.clone(),
            title: self.title.clone(),
            command: self.command.clone(),
            exit_code: self.exit_code,
            timed_out: self.timed_out,
            promise_found: self.promise_found,
            usage: usage.unwrap_or(self.usage),
            validation: self.validation.clone(),
            started_at: self.started_at,
            ended_at: Utc::now(),
            duration_ms: u64::try_from(self.clock.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::priority::{Priority, Tier};
    use crate::core::types::{ValidationKind, ValidationResult};
    use crate::io::control::{RequestedSignal, write_control};
    use crate::test_support::{
        FixedUsage, ScriptedExec, ScriptedExecutor, ScriptedRunner, ScriptedValidator, StubProbe,
        TestProject, sample_task,
    };

    fn always_task() -> DiscoveryEngine {
        DiscoveryEngine::new(vec![Box::new(StubProbe::matching(
            "lint-debt",
            Priority::new(Tier::Improvement, 0),
        ))])
    }

    fn idle_engine() -> DiscoveryEngine {
        DiscoveryEngine::new(vec![Box::new(StubProbe::quiet(
            "quiet",
            Priority::new(Tier::Urgent, 0),
        ))])
    }

    struct Harness {
        project: TestProject,
        runner: ScriptedRunner,
        validator: ScriptedValidator,
        usage: FixedUsage,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                project: TestProject::new(),
                runner: ScriptedRunner::new(),
                validator: ScriptedValidator::new(),
                usage: FixedUsage::unknown(),
            }
        }

        fn run(
            &self,
            engine: &DiscoveryEngine,
            executor: &ScriptedExecutor,
            state: &mut SessionState,
            options: &RunOptions,
            deferred: Option<DiscoveredTask>,
        ) -> RunSummary {
            let control = self.project.control(&state.session_id);
            let deps = LoopDeps {
                engine,
                runner: &self.runner,
                executor,
                validator: &self.validator,
                usage: &self.usage,
                control: &control,
            };
            Orchestrator::new(&self.project.store, &self.project.config, deps)
                .run(state, options, deferred)
                .expect("run")
        }
    }

    fn max(n: u32) -> RunOptions {
        RunOptions {
            max_iterations: Some(n),
            ..RunOptions::default()
        }
    }

    #[test]
    fn stops_after_exactly_max_iterations_and_archives() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::succeeding();
        let mut state = harness.project.store.create(None).expect("create");

        let summary = harness.run(&always_task(), &executor, &mut state, &max(3), None);

        assert_eq!(executor.call_count(), 3);
        assert_eq!(summary.status, LoopStatus::Completed);
        assert_eq!(summary.stop, StopReason::MaxIterations { max: 3 });
        assert_eq!(summary.tally.succeeded, 3);
        assert!(summary.archive_path.is_some());
        let archived = harness
            .project
            .store
            .load_archived(&state.session_id)
            .expect("archived");
        assert_eq!(archived.progress.completed, 3);
        assert_eq!(archived.iteration, 3);
    }

    #[test]
    fn completion_marker_short_circuits() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::new(
            vec![
                ScriptedExec::ok("working"),
                ScriptedExec::ok("done <promise>SHIPPED</promise>"),
            ],
            ScriptedExec::ok("more"),
        );
        let mut state = harness
            .project
            .store
            .create(Some("SHIPPED".to_string()))
            .expect("create");

        let summary = harness.run(&always_task(), &executor, &mut state, &max(10), None);

        assert_eq!(executor.call_count(), 2);
        assert_eq!(summary.status, LoopStatus::Completed);
        assert_eq!(summary.stop, StopReason::PromiseFulfilled);
    }

    #[test]
    fn consecutive_failures_fail_without_checkpoint() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::failing();
        let mut state = harness.project.store.create(None).expect("create");

        let summary = harness.run(&always_task(), &executor, &mut state, &max(10), None);

        assert_eq!(executor.call_count(), 3);
        assert_eq!(summary.status, LoopStatus::Failed);
        assert_eq!(summary.stop, StopReason::ConsecutiveFailures { failures: 3 });
        assert!(summary.checkpoint_path.is_none());
        let paths = harness.project.store.session_paths(&state.session_id);
        assert!(!paths.checkpoint_path.exists());
        let saved = harness.project.store.load(&state.session_id).expect("load");
        assert_eq!(saved.status, LoopStatus::Failed);
        assert_eq!(saved.progress.failed, 3);
    }

    #[test]
    fn missing_agent_counts_as_failed_iteration() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::new(vec![ScriptedExec::NotFound], ScriptedExec::ok("ok"));
        let mut state = harness.project.store.create(None).expect("create");

        let summary = harness.run(&always_task(), &executor, &mut state, &max(2), None);

        assert_eq!(summary.tally.failed, 1);
        assert_eq!(summary.tally.succeeded, 1);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn critical_usage_checkpoints_before_dispatch() {
        let mut harness = Harness::new();
        harness.usage = FixedUsage::new(95);
        let executor = ScriptedExecutor::succeeding();
        let mut state = harness.project.store.create(None).expect("create");

        let summary = harness.run(&always_task(), &executor, &mut state, &max(5), None);

        assert_eq!(executor.call_count(), 0);
        assert_eq!(summary.status, LoopStatus::ContextCleanup);
        assert_eq!(summary.stop, StopReason::CriticalUsage { usage: 95 });
        let checkpoint = harness
            .project
            .store
            .load_checkpoint(&state.session_id)
            .expect("load")
            .expect("checkpoint");
        assert_eq!(checkpoint.reason, CheckpointReason::ContextCleanup);
        assert_eq!(state.budget.cleanup_count, 1);
    }

    #[test]
    fn predicted_overrun_defers_the_task() {
        let mut harness = Harness::new();
        harness.usage = FixedUsage::new(88);
        let executor = ScriptedExecutor::succeeding();
        let engine = DiscoveryEngine::new(vec![Box::new(StubProbe::matching(
            "build-broken",
            Priority::new(Tier::Urgent, 1),
        ))]);
        let mut state = harness.project.store.create(None).expect("create");

        let summary = harness.run(&engine, &executor, &mut state, &max(5), None);

        assert_eq!(executor.call_count(), 0);
        assert_eq!(summary.stop, StopReason::BudgetCleanup { usage: 88, estimate: 15 });
        let checkpoint = harness
            .project
            .store
            .load_checkpoint(&state.session_id)
            .expect("load")
            .expect("checkpoint");
        let deferred = checkpoint.resume_point.deferred_task.expect("deferred task");
        assert_eq!(deferred.probe, "build-broken");
        assert_eq!(state.progress.pending, 1);
    }

    #[test]
    fn deferred_task_is_dispatched_first() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::succeeding();
        let mut state = harness.project.store.create(None).expect("create");
        let deferred = sample_task("open-issues", Priority::new(Tier::Pending, 2));

        harness.run(&always_task(), &executor, &mut state, &max(2), Some(deferred));

        assert_eq!(executor.commands(), vec!["/open-issues", "/lint-debt"]);
    }

    #[test]
    fn dry_run_never_invokes_the_executor() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::succeeding();
        let mut state = harness.project.store.create(None).expect("create");
        let options = RunOptions {
            max_iterations: Some(2),
            dry_run: true,
            skip_validation: false,
        };

        let summary = harness.run(&always_task(), &executor, &mut state, &options, None);

        assert_eq!(executor.call_count(), 0);
        assert_eq!(summary.tally.dry_run, 2);
        assert_eq!(summary.status, LoopStatus::Completed);
    }

    #[test]
    fn idle_iterations_count_toward_the_limit() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::succeeding();
        let mut state = harness.project.store.create(None).expect("create");

        let summary = harness.run(&idle_engine(), &executor, &mut state, &max(2), None);

        assert_eq!(summary.tally.idle, 2);
        assert_eq!(executor.call_count(), 0);
        assert_eq!(summary.status, LoopStatus::Completed);
    }

    #[test]
    fn failed_validation_marks_iteration_unsuccessful() {
        let mut harness = Harness::new();
        harness.validator = ScriptedValidator::new()
            .functional(ValidationResult::failed(ValidationKind::Functional, "1 failed"))
            .functional(ValidationResult::failed(ValidationKind::Functional, "1 failed"));
        let executor = ScriptedExecutor::succeeding();
        let mut state = harness.project.store.create(None).expect("create");

        let summary = harness.run(&always_task(), &executor, &mut state, &max(1), None);

        // Task plus one debug round.
        assert_eq!(executor.call_count(), 2);
        assert_eq!(summary.tally.failed, 1);
        assert!(state.last_validation_failed);
        assert_eq!(state.consecutive_failures, 1);
    }

    #[test]
    fn skip_validation_never_runs_validators() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::succeeding();
        let mut state = harness.project.store.create(None).expect("create");
        let options = RunOptions {
            max_iterations: Some(1),
            dry_run: false,
            skip_validation: true,
        };

        harness.run(&always_task(), &executor, &mut state, &options, None);

        assert_eq!(harness.validator.functional_runs(), 0);
    }

    #[test]
    fn pause_request_checkpoints_and_is_consumed() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::succeeding();
        let mut state = harness.project.store.create(None).expect("create");
        let paths = harness.project.store.session_paths(&state.session_id);
        write_control(&paths.control_path, RequestedSignal::Pause).expect("write");

        let summary = harness.run(&always_task(), &executor, &mut state, &max(5), None);

        assert_eq!(summary.status, LoopStatus::Paused);
        assert_eq!(executor.call_count(), 0);
        assert!(paths.checkpoint_path.exists());
        assert!(!paths.control_path.exists());
        assert!(summary.render().contains("autoloop resume"));
    }

    #[test]
    fn abort_request_fails_the_session() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::succeeding();
        let mut state = harness.project.store.create(None).expect("create");
        let paths = harness.project.store.session_paths(&state.session_id);
        write_control(&paths.control_path, RequestedSignal::Abort).expect("write");

        let summary = harness.run(&always_task(), &executor, &mut state, &max(5), None);

        assert_eq!(summary.status, LoopStatus::Failed);
        assert!(!paths.checkpoint_path.exists());
    }

    #[test]
    fn every_iteration_writes_a_log() {
        let harness = Harness::new();
        let executor = ScriptedExecutor::succeeding();
        let mut state = harness.project.store.create(None).expect("create");

        harness.run(&always_task(), &executor, &mut state, &max(1), None);

        let archived = harness.project.store.paths().archived_session(&state.session_id);
        let iteration = IterationPaths::new(&archived.iterations_dir, 1);
        assert!(iteration.meta_path.is_file());
        assert_eq!(
            fs::read_to_string(&iteration.output_path).expect("output"),
            "done"
        );
        let events = AuditLog::new(archived.events_path).read_all().expect("events");
        assert!(events.iter().any(|e| e.kind == EventKind::Decision));
        assert!(events.iter().any(|e| e.kind == EventKind::Validation));
    }
}
