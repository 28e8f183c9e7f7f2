//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples the loop from the actual agent backend
//! (by default `claude -p <task>`). Tests use scripted executors that return
//! predetermined outputs without spawning processes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::control::SignalHandler;
use crate::io::process::{CommandRunner, CommandSpec};

/// Parameters for an executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the executor process.
    pub workdir: PathBuf,
    /// Task command handed verbatim to the agent.
    pub command: String,
    pub timeout: Duration,
    /// Keep only the newest this-many bytes of captured output.
    pub output_limit_bytes: usize,
    /// When set, stdout lines are written here as they arrive.
    pub stream_path: Option<PathBuf>,
    /// Ctrl-C on this handler stops the agent mid-task.
    pub cancel: Option<SignalHandler>,
}

/// Result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    /// Merged stdout and stderr.
    pub output: String,
    /// Exit code zero and no timeout.
    pub success: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
}

/// Abstraction over agent execution backends.
///
/// A nonzero exit or a timeout is an unsuccessful [`ExecOutput`]. An `Err`
/// means the agent could not be started at all (for example the executable is
/// missing, see [`crate::io::process::CommandError`]).
pub trait Executor {
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput>;
}

/// Executor that runs the configured agent command with the task appended.
pub struct AgentExecutor<R> {
    command: Vec<String>,
    runner: R,
}

impl<R: CommandRunner> AgentExecutor<R> {
    pub fn new(command: Vec<String>, runner: R) -> Self {
        Self { command, runner }
    }
}

impl<R: CommandRunner> Executor for AgentExecutor<R> {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), streaming = request.stream_path.is_some()))]
    fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        let mut spec = CommandSpec::from_argv(&self.command, &request.workdir)
            .context("executor command")?
            .arg(request.command.as_str())
            .timeout(request.timeout)
            .output_limit(request.output_limit_bytes);
        if let Some(path) = &request.stream_path {
            spec = spec.stream_to(path);
        }
        if let Some(handler) = &request.cancel {
            spec = spec.cancel_on(handler.clone());
        }
        info!(program = %spec.program, task = %request.command, "starting agent");

        let result = self.runner.run(&spec)?;
        if result.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
        } else if !result.success() {
            warn!(exit_code = ?result.exit_code, "agent exited unsuccessfully");
        } else {
            debug!("agent completed successfully");
        }

        let mut output = result.combined();
        if result.timed_out {
            output.push_str(&format!(
                "\n[agent timed out after {}s]\n",
                request.timeout.as_secs()
            ));
        }
        Ok(ExecOutput {
            success: result.success(),
            timed_out: result.timed_out,
            exit_code: result.exit_code,
            output,
        })
    }
}
