//! I/O adapters for the orchestrator.

pub mod atomic;
pub mod audit_log;
pub mod config;
pub mod control;
pub mod executor;
pub mod git;
pub mod iteration_log;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod session_store;
pub mod usage;
