//! Development-time tracing.
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, written to stderr.
//!   Not persisted.
//! - **Session artifacts (`io/audit_log`, `io/iteration_log`)**: `events.jsonl`
//!   and `iterations/<n>/` under the session directory. Always written,
//!   unaffected by `RUST_LOG`.
//! - **Operator output**: iteration banners and the termination summary go to
//!   stdout.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=autoloop=debug autoloop run --max 3
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
