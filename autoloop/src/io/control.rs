//! Cooperative cancellation: in-process interrupt flag plus `control.json`.
//!
//! The loop polls [`ControlChannel::poll`] between steps, never mid-write.
//! `autoloop pause`/`abort` from another process write `control.json`;
//! Ctrl-C sets the in-process flag.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::atomic::write_json_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    None,
    Pause,
    Interrupt,
    Abort,
}

impl From<u8> for ControlSignal {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Pause,
            2 => Self::Interrupt,
            3 => Self::Abort,
            _ => Self::None,
        }
    }
}

impl From<ControlSignal> for u8 {
    fn from(s: ControlSignal) -> Self {
        match s {
            ControlSignal::None => 0,
            ControlSignal::Pause => 1,
            ControlSignal::Interrupt => 2,
            ControlSignal::Abort => 3,
        }
    }
}

/// In-process signal shared with the Ctrl-C handler.
#[derive(Debug, Clone, Default)]
pub struct SignalHandler {
    signal: Arc<AtomicU8>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, signal: ControlSignal) {
        self.signal.store(signal.into(), Ordering::SeqCst);
    }

    pub fn check(&self) -> ControlSignal {
        ControlSignal::from(self.signal.load(Ordering::SeqCst))
    }

    pub fn clear(&self) {
        self.signal.store(0, Ordering::SeqCst);
    }

    /// Route Ctrl-C to [`ControlSignal::Interrupt`]. Call once per process.
    pub fn install_ctrlc(&self) -> Result<()> {
        let handler = self.clone();
        ctrlc::set_handler(move || handler.send(ControlSignal::Interrupt))
            .context("install Ctrl-C handler")
    }
}

/// Request written by `autoloop pause|abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestedSignal {
    Pause,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub signal: RequestedSignal,
    pub at: DateTime<Utc>,
}

pub fn write_control(path: &Path, signal: RequestedSignal) -> Result<()> {
    write_json_atomic(
        path,
        &ControlRequest {
            signal,
            at: Utc::now(),
        },
    )
}

/// Read a pending request. Unreadable files are ignored with a warning.
pub fn read_control(path: &Path) -> Option<ControlRequest> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return None,
    };
    match serde_json::from_str(&contents) {
        Ok(request) => Some(request),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "ignoring malformed control request");
            None
        }
    }
}

pub fn clear_control(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

/// Everything the loop polls for cancellation.
#[derive(Debug, Clone)]
pub struct ControlChannel {
    handler: SignalHandler,
    control_path: PathBuf,
}

impl ControlChannel {
    pub fn new(handler: SignalHandler, control_path: impl Into<PathBuf>) -> Self {
        Self {
            handler,
            control_path: control_path.into(),
        }
    }

    /// The in-process half, for commands that should stop on Ctrl-C.
    pub fn handler(&self) -> &SignalHandler {
        &self.handler
    }

    /// In-process signals win over file requests.
    pub fn poll(&self) -> ControlSignal {
        let local = self.handler.check();
        if local != ControlSignal::None {
            return local;
        }
        match read_control(&self.control_path) {
            Some(request) => {
                debug!(signal = ?request.signal, "control request found");
                match request.signal {
                    RequestedSignal::Pause => ControlSignal::Pause,
                    RequestedSignal::Abort => ControlSignal::Abort,
                }
            }
            None => ControlSignal::None,
        }
    }

    /// Consume any pending signal once it has been acted upon.
    pub fn acknowledge(&self) -> Result<()> {
        self.handler.clear();
        clear_control(&self.control_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_requests_are_polled_and_cleared() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("control.json");
        let channel = ControlChannel::new(SignalHandler::new(), &path);
        assert_eq!(channel.poll(), ControlSignal::None);

        write_control(&path, RequestedSignal::Pause).expect("write");
        assert_eq!(channel.poll(), ControlSignal::Pause);
        write_control(&path, RequestedSignal::Abort).expect("write");
        assert_eq!(channel.poll(), ControlSignal::Abort);

        channel.acknowledge().expect("ack");
        assert!(!path.exists());
        assert_eq!(channel.poll(), ControlSignal::None);
    }

    #[test]
    fn in_process_signal_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("control.json");
        let handler = SignalHandler::new();
        let channel = ControlChannel::new(handler.clone(), &path);
        write_control(&path, RequestedSignal::Abort).expect("write");
        handler.send(ControlSignal::Interrupt);
        assert_eq!(channel.poll(), ControlSignal::Interrupt);
    }

    #[test]
    fn malformed_request_is_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("control.json");
        fs::write(&path, "pause please").expect("write");
        assert_eq!(read_control(&path), None);
    }
}
