//! Autonomous task-discovery and orchestration loop.
//!
//! Each iteration discovers the single highest-priority unit of work in a
//! project, checks it against a finite context budget, hands it to an
//! external agent, validates the result and persists a resumable session.
//!
//! - **[`core`]**: Pure, deterministic logic (priorities, budget predictor,
//!   session state, completion markers). No I/O.
//! - **[`io`]**: Side-effecting adapters (processes, git, config, session
//!   store, logs, control requests). Isolated behind traits for tests.
//! - **[`discovery`]**: The probe cascade.
//!
//! [`orchestrator`] and [`validation`] coordinate core logic with I/O;
//! [`commands`] implements the CLI.

pub mod commands;
pub mod core;
pub mod discovery;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validation;
