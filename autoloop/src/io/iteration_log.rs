//! Per-iteration logs under `<session>/iterations/<n>/`.
//!
//! Product artifacts: always written, unaffected by `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::atomic::write_json_atomic;
use crate::core::types::ValidationResult;

/// What happened in one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationOutcome {
    Succeeded,
    Failed,
    ValidationFailed,
    DryRun,
    Idle,
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMeta {
    pub session_id: String,
    pub iteration: u32,
    pub outcome: IterationOutcome,
    pub probe: Option<String>,
    pub priority: Option<String>,
    pub title: Option<String>,
    pub command: Option<String>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub promise_found: bool,
    pub usage: u8,
    pub validation: Vec<ValidationResult>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub output_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, iteration: u32) -> Self {
        let dir = iterations_dir.join(iteration.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            output_path: dir.join("output.log"),
            dir,
        }
    }
}

/// Write `meta.json` and, when present, the last `output_limit` bytes of output to `output.log`.
pub fn write_iteration(
    paths: &IterationPaths,
    meta: &IterationMeta,
    output: Option<&str>,
    output_limit: usize,
) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;
    write_json_atomic(&paths.meta_path, meta)?;
    if let Some(output) = output {
        let text = tail_utf8(output, output_limit);
        fs::write(&paths.output_path, text)
            .with_context(|| format!("write {}", paths.output_path.display()))?;
    }
    Ok(())
}

fn tail_utf8(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> IterationMeta {
        let now = Utc::now();
        IterationMeta {
            session_id: "auto-1".to_string(),
            iteration: 3,
            outcome: IterationOutcome::Succeeded,
            probe: Some("lint-debt".to_string()),
            priority: Some("T4.0".to_string()),
            title: Some("fix lint".to_string()),
            command: Some("/check --fix".to_string()),
            exit_code: Some(0),
            timed_out: false,
            promise_found: false,
            usage: 30,
            validation: Vec::new(),
            started_at: now,
            ended_at: now,
            duration_ms: 0,
        }
    }

    #[test]
    fn iteration_paths_are_stable() {
        let paths = IterationPaths::new(Path::new("/s/iterations"), 3);
        assert_eq!(paths.dir, PathBuf::from("/s/iterations/3"));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.output_path.ends_with("output.log"));
    }

    #[test]
    fn writes_meta_and_truncated_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = IterationPaths::new(temp.path(), 3);
        let meta_copy = meta();
        write_iteration(&paths, &meta_copy, Some("héllo wörld"), 4).expect("write");

        let loaded: IterationMeta =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("read"))
                .expect("parse");
        assert_eq!(loaded, meta_copy);
        // The last four bytes start inside "ö", so the cut moves forward to "rld".
        assert_eq!(fs::read_to_string(&paths.output_path).expect("read"), "rld");
    }
}
