//! Scripted collaborators for unit and integration tests.
//!
//! Nothing here spawns processes: command output, agent output, validator
//! results and usage readings are all queued up front.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Result, bail};
use tempfile::TempDir;

use crate::core::priority::Priority;
use crate::core::types::{DiscoveredTask, ValidationKind, ValidationResult};
use crate::discovery::{Environment, Probe, SessionView, new_task};
use crate::io::config::{AutoConfig, DiscoveryConfig};
use crate::io::control::{ControlChannel, SignalHandler};
use crate::io::executor::{ExecOutput, ExecRequest, Executor};
use crate::io::process::{CommandError, CommandResult, CommandRunner, CommandSpec};
use crate::io::paths::{InitOptions, init_workspace};
use crate::io::session_store::SessionStore;
use crate::io::usage::UsageSource;
use crate::validation::Validator;

/// Successful command with the given stdout.
pub fn stdout(text: &str) -> CommandResult {
    CommandResult {
        stdout: text.to_string(),
        exit_code: Some(0),
        ..CommandResult::default()
    }
}

pub fn exit_with(code: i32, stdout: &str, stderr: &str) -> CommandResult {
    CommandResult {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code: Some(code),
        ..CommandResult::default()
    }
}

/// Command runner answering by command-line prefix.
///
/// The first registered prefix that matches `CommandSpec::display()` wins.
/// Unmatched commands fail with [`CommandError::NotFound`], as if the tool
/// were not installed.
#[derive(Default)]
pub struct ScriptedRunner {
    responses: Vec<(String, CommandResult)>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, prefix: &str, result: CommandResult) -> Self {
        self.responses.push((prefix.to_string(), result));
        self
    }

    /// Command lines seen so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandResult> {
        let line = spec.display();
        self.calls.borrow_mut().push(line.clone());
        match self
            .responses
            .iter()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
        {
            Some((_, result)) => Ok(result.clone()),
            None => Err(CommandError::NotFound {
                program: spec.program.clone(),
            }
            .into()),
        }
    }
}

/// Scratch project plus everything a probe needs to run.
pub struct ProbeFixture {
    temp: TempDir,
    config: DiscoveryConfig,
    session: SessionView,
    runner: ScriptedRunner,
}

impl ProbeFixture {
    pub fn new() -> Self {
        Self {
            temp: tempfile::tempdir().expect("tempdir"),
            config: DiscoveryConfig::default(),
            session: SessionView::detached(),
            runner: ScriptedRunner::new(),
        }
    }

    pub fn with_config(mut self, edit: impl FnOnce(&mut DiscoveryConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    pub fn with_session(mut self, session: SessionView) -> Self {
        self.session = session;
        self
    }

    pub fn respond(mut self, prefix: &str, result: CommandResult) -> Self {
        self.runner = self.runner.respond(prefix, result);
        self
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Write a project file, creating parent directories.
    pub fn write_file(&self, relative: &str, contents: &str) {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, contents).expect("write fixture file");
    }

    pub fn check(&self, probe: &dyn Probe) -> Result<Option<DiscoveredTask>> {
        let env = Environment {
            root: self.root(),
            config: &self.config,
            session: &self.session,
            runner: &self.runner,
        };
        probe.check(&env)
    }
}

impl Default for ProbeFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum StubBehavior {
    Match,
    Quiet,
    Fail,
}

/// Probe with a fixed answer, for engine ordering tests.
pub struct StubProbe {
    id: &'static str,
    priority: Priority,
    behavior: StubBehavior,
}

impl StubProbe {
    pub fn matching(id: &'static str, priority: Priority) -> Self {
        Self {
            id,
            priority,
            behavior: StubBehavior::Match,
        }
    }

    pub fn quiet(id: &'static str, priority: Priority) -> Self {
        Self {
            id,
            priority,
            behavior: StubBehavior::Quiet,
        }
    }

    pub fn failing(id: &'static str, priority: Priority) -> Self {
        Self {
            id,
            priority,
            behavior: StubBehavior::Fail,
        }
    }
}

impl Probe for StubProbe {
    fn id(&self) -> &'static str {
        self.id
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn task_type(&self) -> &'static str {
        "default"
    }

    fn check(&self, _env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        match self.behavior {
            StubBehavior::Match => Ok(Some(new_task(
                self,
                "stub",
                format!("{} task", self.id),
                format!("/{}", self.id),
            ))),
            StubBehavior::Quiet => Ok(None),
            StubBehavior::Fail => bail!("{} tool exploded", self.id),
        }
    }
}

/// Deterministic task attributed to `probe`.
pub fn sample_task(probe: &str, priority: Priority) -> DiscoveredTask {
    DiscoveredTask {
        priority,
        probe: probe.to_string(),
        category: "sample".to_string(),
        title: format!("{probe} task"),
        description: String::new(),
        command: format!("/{probe}"),
        details: None,
        parallel_agents: 1,
        task_type: "default".to_string(),
        affected_files: 1,
        complexity: Default::default(),
    }
}

/// One scripted agent reply.
#[derive(Debug, Clone)]
pub enum ScriptedExec {
    Output(ExecOutput),
    /// The agent executable is missing.
    NotFound,
}

impl ScriptedExec {
    pub fn ok(output: &str) -> Self {
        Self::Output(ExecOutput {
            output: output.to_string(),
            success: true,
            timed_out: false,
            exit_code: Some(0),
        })
    }

    pub fn fail(output: &str) -> Self {
        Self::Output(ExecOutput {
            output: output.to_string(),
            success: false,
            timed_out: false,
            exit_code: Some(1),
        })
    }
}

/// Executor replaying queued replies; once the queue is empty it repeats
/// the fallback reply.
pub struct ScriptedExecutor {
    queue: RefCell<VecDeque<ScriptedExec>>,
    fallback: ScriptedExec,
    commands: RefCell<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(replies: Vec<ScriptedExec>, fallback: ScriptedExec) -> Self {
        Self {
            queue: RefCell::new(replies.into()),
            fallback,
            commands: RefCell::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Vec::new(), ScriptedExec::ok("done"))
    }

    pub fn failing() -> Self {
        Self::new(Vec::new(), ScriptedExec::fail("boom"))
    }

    pub fn call_count(&self) -> usize {
        self.commands.borrow().len()
    }

    /// Task commands received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl Executor for ScriptedExecutor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        self.commands.borrow_mut().push(request.command.clone());
        let reply = self
            .queue
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            ScriptedExec::Output(output) => Ok(output),
            ScriptedExec::NotFound => Err(CommandError::NotFound {
                program: "agent".to_string(),
            }
            .into()),
        }
    }
}

/// Validator replaying queued results; an empty queue passes.
#[derive(Default)]
pub struct ScriptedValidator {
    functional: RefCell<VecDeque<ValidationResult>>,
    coverage: RefCell<VecDeque<ValidationResult>>,
    functional_runs: Cell<usize>,
    coverage_runs: Cell<usize>,
}

impl ScriptedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn functional(self, result: ValidationResult) -> Self {
        self.functional.borrow_mut().push_back(result);
        self
    }

    pub fn coverage(self, result: ValidationResult) -> Self {
        self.coverage.borrow_mut().push_back(result);
        self
    }

    pub fn functional_runs(&self) -> usize {
        self.functional_runs.get()
    }

    pub fn coverage_runs(&self) -> usize {
        self.coverage_runs.get()
    }
}

fn passing(kind: ValidationKind) -> ValidationResult {
    ValidationResult {
        passed: true,
        kind,
        total: 1,
        passed_count: 1,
        failed_count: 0,
        coverage_percent: None,
        error: None,
    }
}

impl Validator for ScriptedValidator {
    fn run_functional_validation(&self) -> ValidationResult {
        self.functional_runs.set(self.functional_runs.get() + 1);
        self.functional
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| passing(ValidationKind::Functional))
    }

    fn run_coverage_validation(&self) -> ValidationResult {
        self.coverage_runs.set(self.coverage_runs.get() + 1);
        self.coverage
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| passing(ValidationKind::Coverage))
    }
}

/// Usage source returning queued readings, then the last one forever.
pub struct FixedUsage {
    readings: RefCell<VecDeque<Option<u8>>>,
    last: Cell<Option<u8>>,
}

impl FixedUsage {
    pub fn new(percent: u8) -> Self {
        Self::sequence(vec![Some(percent)])
    }

    pub fn unknown() -> Self {
        Self::sequence(Vec::new())
    }

    pub fn sequence(readings: Vec<Option<u8>>) -> Self {
        Self {
            readings: RefCell::new(readings.into()),
            last: Cell::new(None),
        }
    }
}

impl UsageSource for FixedUsage {
    fn current_usage(&self) -> Result<Option<u8>> {
        if let Some(reading) = self.readings.borrow_mut().pop_front() {
            self.last.set(reading);
        }
        Ok(self.last.get())
    }
}

/// Initialised `.auto/` workspace in a scratch directory, with zero
/// cooldown and idle backoff so loops run without sleeping.
pub struct TestProject {
    temp: TempDir,
    pub store: SessionStore,
    pub config: AutoConfig,
}

impl TestProject {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions { force: false }).expect("init");
        let mut config = AutoConfig::default();
        config.looping.cooldown_secs = 0;
        config.looping.idle_backoff_secs = 0;
        Self {
            temp,
            store: SessionStore::new(paths),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Control channel for `session_id` with a private in-process flag.
    pub fn control(&self, session_id: &str) -> ControlChannel {
        ControlChannel::new(
            SignalHandler::new(),
            self.store.session_paths(session_id).control_path,
        )
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}
