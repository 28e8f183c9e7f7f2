//! `autoloop`: autonomous task-discovery and orchestration loop.
//!
//! Sessions live under `.auto/sessions/` in the current directory. Without a
//! subcommand, `autoloop` behaves like `autoloop run`.

use anyhow::{Context, Result};
use autoloop::commands::{self, LoopArgs, exit_code_for_error};
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "autoloop",
    version,
    about = "Autonomous task-discovery and orchestration loop",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    run: LoopFlags,
}

#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
struct LoopFlags {
    /// Stop after N iterations in this invocation.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    max: Option<u32>,
    /// Completion marker text; `<promise>TEXT</promise>` in agent output ends the session.
    #[arg(long, value_name = "TEXT")]
    promise: Option<String>,
    /// Discover and log tasks without invoking the agent.
    #[arg(long)]
    dry_run: bool,
    /// Skip functional and coverage validation.
    #[arg(long)]
    skip_validation: bool,
}

impl From<LoopFlags> for LoopArgs {
    fn from(flags: LoopFlags) -> Self {
        LoopArgs {
            max: flags.max,
            promise: flags.promise,
            dry_run: flags.dry_run,
            skip_validation: flags.skip_validation,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Start a new session and run the loop.
    Run(LoopFlags),
    /// Continue a paused or cleaned-up session (latest resumable by default).
    Resume {
        session_id: Option<String>,
        #[command(flatten)]
        flags: LoopFlags,
    },
    /// Show session state.
    Status { session_id: Option<String> },
    /// Run discovery once and print the next task.
    Discover {
        /// Evaluate every probe and report each outcome.
        #[arg(long)]
        report: bool,
    },
    /// Ask a running loop to checkpoint and stop.
    Pause { session_id: Option<String> },
    /// Stop a session without a checkpoint.
    Abort { session_id: Option<String> },
    /// Record the current context usage percentage.
    ReportUsage { percent: f64 },
    /// Create `.auto/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    autoloop::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_code_for_error(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        None => commands::cmd_run(&root, &cli.run.into()),
        Some(Command::Run(flags)) => commands::cmd_run(&root, &flags.into()),
        Some(Command::Resume { session_id, flags }) => {
            commands::cmd_resume(&root, session_id.as_deref(), &flags.into())
        }
        Some(Command::Status { session_id }) => commands::cmd_status(&root, session_id.as_deref()),
        Some(Command::Discover { report }) => commands::cmd_discover(&root, report),
        Some(Command::Pause { session_id }) => commands::cmd_pause(&root, session_id.as_deref()),
        Some(Command::Abort { session_id }) => commands::cmd_abort(&root, session_id.as_deref()),
        Some(Command::ReportUsage { percent }) => commands::cmd_report_usage(&root, percent),
        Some(Command::Init { force }) => commands::cmd_init(&root, force),
    }
}
