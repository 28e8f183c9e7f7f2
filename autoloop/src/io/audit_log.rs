//! Append-only session audit log (`events.jsonl`).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Decision,
    Action,
    Checkpoint,
    Validation,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub phase: String,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single JSON line.
    pub fn record(&self, kind: EventKind, phase: &str, data: Value) -> Result<()> {
        let event = AuditEvent {
            at: Utc::now(),
            kind,
            phase: phase.to_string(),
            data,
        };
        let mut line = serde_json::to_string(&event).context("serialize audit event")?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }

    /// Read every event; a missing log is empty.
    pub fn read_all(&self) -> Result<Vec<AuditEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parse {} line {}", self.path.display(), idx + 1))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn appends_events_in_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(temp.path().join("s/events.jsonl"));
        log.record(EventKind::Decision, "discovery", json!({"probe": "lint-debt"}))
            .expect("record");
        log.record(EventKind::Action, "execute", json!({"success": true}))
            .expect("record");

        let events = log.read_all().expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Decision);
        assert_eq!(events[1].phase, "execute");
        assert_eq!(events[1].data["success"], json!(true));

        let raw = fs::read_to_string(log.path()).expect("raw");
        assert!(raw.lines().next().is_some_and(|l| l.contains("\"kind\":\"decision\"")));
    }

    #[test]
    fn missing_log_reads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(temp.path().join("events.jsonl"));
        assert!(log.read_all().expect("read").is_empty());
    }
}
