//! Stable exit codes for autoloop CLI commands.

use crate::core::types::LoopStatus;

/// Command succeeded; the loop completed or paused.
pub const OK: i32 = 0;
/// The loop failed, or an unexpected error occurred.
pub const FAILED: i32 = 1;
/// Invalid input or configuration, unknown session, or corrupt session state.
pub const INVALID: i32 = 2;
/// The loop stopped for a context cleanup; resume after the budget resets.
pub const CONTEXT_CLEANUP: i32 = 3;

/// Exit code for the status a loop invocation ended in.
pub fn for_status(status: LoopStatus) -> i32 {
    match status {
        LoopStatus::Completed | LoopStatus::Paused => OK,
        LoopStatus::ContextCleanup => CONTEXT_CLEANUP,
        LoopStatus::Failed | LoopStatus::Running => FAILED,
    }
}
