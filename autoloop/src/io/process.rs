//! One way to run external commands: bounded by a timeout, output captured.
//!
//! Every probe, the executor and every validator go through [`CommandRunner`],
//! which lets tests substitute scripted output without spawning processes.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use super::control::{ControlSignal, SignalHandler};

/// A command to run: program, arguments, working directory and limits.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Newest bytes of stdout/stderr kept in memory (each); older bytes are dropped and counted.
    pub output_limit_bytes: usize,
    /// When set, stdout lines are also appended to this file as they arrive.
    pub stream_path: Option<PathBuf>,
    /// An interrupt raised on this handler kills the command early.
    pub cancel: Option<SignalHandler>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: workdir.into(),
            timeout: Duration::from_secs(30),
            output_limit_bytes: 1_000_000,
            stream_path: None,
            cancel: None,
        }
    }

    /// Build a spec from an argv-style vector (`["gh", "pr", "list"]`).
    pub fn from_argv(argv: &[String], workdir: impl Into<PathBuf>) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("command must not be empty"))?;
        Ok(Self::new(program.clone(), workdir).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }

    pub fn stream_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stream_path = Some(path.into());
        self
    }

    pub fn cancel_on(mut self, handler: SignalHandler) -> Self {
        self.cancel = Some(handler);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|handler| handler.check() == ControlSignal::Interrupt)
    }

    /// Human-readable command line, used in logs and error messages.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured output of a finished (or killed) command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Merged output: stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        if self.stdout_truncated > 0 || self.stderr_truncated > 0 {
            out.insert_str(
                0,
                &format!(
                    "[earlier output dropped: stdout {} bytes, stderr {} bytes]\n",
                    self.stdout_truncated, self.stderr_truncated
                ),
            );
        }
        out
    }
}

/// Failure to start a command at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The executable does not exist on `PATH` (or at the given path).
    NotFound { program: String },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::NotFound { program } => {
                write!(f, "executable not found: '{program}' (is it installed and on PATH?)")
            }
        }
    }
}

impl std::error::Error for CommandError {}

/// True if `err` says the tool itself is missing.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<CommandError>(),
        Some(CommandError::NotFound { .. })
    )
}

/// Abstraction over external command execution.
pub trait CommandRunner {
    /// Run the command to completion or until its timeout.
    ///
    /// A nonzero exit or a timeout is reported through [`CommandResult`], not as
    /// an error. Errors mean the command could not be run (see [`CommandError`]).
    fn run(&self, spec: &CommandSpec) -> Result<CommandResult>;
}

/// Runner that spawns real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandResult> {
        run_command_with_timeout(spec)
    }
}

/// Granularity of the wait loop; bounds how late a cancellation is noticed.
const WAIT_SLICE: Duration = Duration::from_millis(100);
/// How long output readers may keep running after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Run a command with a timeout, capturing stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. Only the newest
/// `output_limit_bytes` of each stream are kept; earlier bytes are dropped and
/// counted. If `stream_path` is set, each stdout line is also written (and
/// flushed) to that file for live observation.
///
/// On Unix the child leads its own process group. A timeout or a cancellation
/// kills the whole group, and readers still blocked on pipes held open by
/// leftover descendants are abandoned after a short grace period.
#[instrument(skip_all, fields(cmd = %spec.program, timeout_secs = spec.timeout.as_secs()))]
pub fn run_command_with_timeout(spec: &CommandSpec) -> Result<CommandResult> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let tee = match &spec.stream_path {
        Some(path) => Some(Arc::new(Mutex::new(open_stream_file(path)?))),
        None => None,
    };

    debug!(command = %spec.display(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(program = %spec.program, "executable not found");
            return Err(CommandError::NotFound {
                program: spec.program.clone(),
            }
            .into());
        }
        Err(err) => {
            error!(err = %err, "failed to spawn command");
            return Err(err).with_context(|| format!("spawn {}", spec.display()));
        }
    };
    let started = Instant::now();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_capture = Arc::new(Mutex::new(TailCapture::new(spec.output_limit_bytes)));
    let stderr_capture = Arc::new(Mutex::new(TailCapture::new(spec.output_limit_bytes)));
    let (done_tx, done_rx) = mpsc::channel();
    let capture = Arc::clone(&stdout_capture);
    spawn_reader(
        "stdout",
        move || read_lines(stdout, &capture, tee.as_deref()),
        done_tx.clone(),
    );
    let capture = Arc::clone(&stderr_capture);
    spawn_reader("stderr", move || read_chunks(stderr, &capture), done_tx);

    let mut timed_out = false;
    let mut cancelled = false;
    let exited = loop {
        let elapsed = started.elapsed();
        if elapsed >= spec.timeout {
            warn!(timeout_secs = spec.timeout.as_secs(), "command timed out, killing");
            timed_out = true;
            break None;
        }
        if spec.is_cancelled() {
            warn!("command cancelled, killing");
            cancelled = true;
            break None;
        }
        let slice = (spec.timeout - elapsed).min(WAIT_SLICE);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break Some(status);
        }
    };
    let status = match exited {
        Some(status) => status,
        None => {
            kill_process_tree(&mut child);
            child.wait().context("wait command after kill")?
        }
    };

    let drain_deadline = if timed_out || cancelled {
        Instant::now() + DRAIN_GRACE
    } else {
        (started + spec.timeout).max(Instant::now() + DRAIN_GRACE)
    };
    let mut open_readers = 2;
    while open_readers > 0 {
        let wait = drain_deadline.saturating_duration_since(Instant::now());
        match done_rx.recv_timeout(wait) {
            Ok(()) => open_readers -= 1,
            Err(RecvTimeoutError::Timeout) => {
                warn!(open_readers, "output pipes still held open by descendants; detaching readers");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let (stdout, stdout_truncated) = take_capture(&stdout_capture);
    let (stderr, stderr_truncated) = take_capture(&stderr_capture);
    if stdout_truncated > 0 || stderr_truncated > 0 {
        debug!(stdout_truncated, stderr_truncated, "earlier output dropped");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: status.code(),
        timed_out,
        stdout_truncated,
        stderr_truncated,
    })
}

/// Kill the child and, on Unix, every process in its group.
fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id())
            && let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL)
        {
            debug!(err = %err, "kill process group");
        }
    }
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill child");
    }
}

fn open_stream_file(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create stream dir {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("create stream file {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Rolling window over the newest `limit` bytes of a stream.
#[derive(Debug)]
struct TailCapture {
    buf: Vec<u8>,
    dropped: usize,
    limit: usize,
}

impl TailCapture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            dropped: 0,
            limit,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        // Compact lazily so each byte is moved a bounded number of times.
        if self.buf.len() > self.limit.saturating_mul(2) {
            self.compact();
        }
    }

    fn compact(&mut self) {
        if self.buf.len() > self.limit {
            let excess = self.buf.len() - self.limit;
            self.buf.drain(..excess);
            self.dropped += excess;
        }
    }

    fn take(&mut self) -> (Vec<u8>, usize) {
        self.compact();
        (std::mem::take(&mut self.buf), self.dropped)
    }
}

fn take_capture(capture: &Mutex<TailCapture>) -> (Vec<u8>, usize) {
    capture
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
}

fn spawn_reader<F>(name: &'static str, read: F, done: mpsc::Sender<()>)
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    thread::spawn(move || {
        if let Err(err) = read() {
            warn!(stream = name, err = %format!("{err:#}"), "output reader failed");
        }
        // The receiver is gone once the runner stopped waiting.
        let _ = done.send(());
    });
}

fn read_lines<R: Read>(
    reader: R,
    capture: &Mutex<TailCapture>,
    tee: Option<&Mutex<BufWriter<File>>>,
) -> Result<()> {
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            return Ok(());
        }
        if let Some(tee) = tee
            && let Ok(mut writer) = tee.lock()
            && let Err(err) = writer.write_all(&line).and_then(|_| writer.flush())
        {
            warn!(err = %err, "failed to write to stream file");
        }
        capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(&line);
    }
}

fn read_chunks<R: Read>(mut reader: R, capture: &Mutex<TailCapture>) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, dir: &Path) -> CommandSpec {
        CommandSpec::new("sh", dir)
            .arg("-c")
            .arg(script)
            .timeout(Duration::from_secs(10))
    }

    #[test]
    fn captures_stdout_stderr_and_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = run_command_with_timeout(&sh("echo out; echo err >&2; exit 3", temp.path()))
            .expect("run");
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.success());
        assert!(result.combined().contains("out\nerr"));
    }

    #[test]
    fn kills_on_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = sh("sleep 5", temp.path()).timeout(Duration::from_millis(200));
        let result = run_command_with_timeout(&spec).expect("run");
        assert!(result.timed_out);
        assert!(!result.success());
    }

    #[test]
    fn missing_executable_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new("definitely-not-a-real-binary-4821", temp.path());
        let err = run_command_with_timeout(&spec).unwrap_err();
        assert!(is_not_found(&err));
        assert!(err.to_string().contains("executable not found"));
    }

    #[test]
    fn keeps_newest_bytes_beyond_limit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = sh("printf 'abcdefghij'", temp.path()).output_limit(4);
        let result = run_command_with_timeout(&spec).expect("run");
        assert_eq!(result.stdout, "ghij");
        assert_eq!(result.stdout_truncated, 6);
        assert!(result.combined().starts_with("[earlier output dropped"));
    }

    #[test]
    fn completion_marker_after_large_output_survives() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = sh(
            "yes filler | head -n 50000; echo '<promise>DONE</promise>'",
            temp.path(),
        )
        .output_limit(1000);
        let result = run_command_with_timeout(&spec).expect("run");
        assert!(result.stdout_truncated > 0);
        assert!(result.stdout.len() <= 1000);
        assert!(result.stdout.ends_with("<promise>DONE</promise>\n"));
    }

    #[test]
    fn timeout_is_not_held_up_by_background_descendants() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = sh("(sleep 5; echo late) & sleep 5", temp.path())
            .timeout(Duration::from_millis(300));
        let started = Instant::now();
        let result = run_command_with_timeout(&spec).expect("run");
        assert!(result.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!result.stdout.contains("late"));
    }

    #[test]
    fn interrupt_on_cancel_handler_stops_the_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let handler = SignalHandler::new();
        let spec = sh("sleep 5", temp.path()).cancel_on(handler.clone());
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            handler.send(ControlSignal::Interrupt);
        });
        let started = Instant::now();
        let result = run_command_with_timeout(&spec).expect("run");
        sender.join().expect("sender");
        assert!(!result.success());
        assert!(!result.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn pause_does_not_cancel_a_running_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let handler = SignalHandler::new();
        handler.send(ControlSignal::Pause);
        let spec = sh("echo finished", temp.path()).cancel_on(handler);
        let result = run_command_with_timeout(&spec).expect("run");
        assert!(result.success());
        assert_eq!(result.stdout, "finished\n");
    }

    #[test]
    fn streams_stdout_lines_to_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let stream = temp.path().join("logs/stream.log");
        let spec = sh("echo one; echo two", temp.path()).stream_to(&stream);
        run_command_with_timeout(&spec).expect("run");
        let contents = std::fs::read_to_string(&stream).expect("read stream");
        assert_eq!(contents, "one\ntwo\n");
    }

    #[test]
    fn from_argv_rejects_empty() {
        assert!(CommandSpec::from_argv(&[], "/tmp").is_err());
        let spec = CommandSpec::from_argv(&["gh".to_string(), "pr".to_string()], "/tmp")
            .expect("spec");
        assert_eq!(spec.display(), "gh pr");
    }
}
