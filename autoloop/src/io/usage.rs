//! Budget usage reported by an external monitor.

use std::path::PathBuf;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::atomic::{read_json_opt, write_json_atomic};

/// Source of the current budget usage percentage.
pub trait UsageSource {
    /// `Ok(None)` means no reading is available; the caller keeps its last value.
    fn current_usage(&self) -> Result<Option<u8>>;
}

/// On-disk usage report (`{"percent": N}`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    pub percent: f64,
}

/// Reads the JSON usage report written by `autoloop report-usage`.
#[derive(Debug, Clone)]
pub struct FileUsageSource {
    path: PathBuf,
}

impl FileUsageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl UsageSource for FileUsageSource {
    fn current_usage(&self) -> Result<Option<u8>> {
        let report: Option<UsageReport> = read_json_opt(&self.path)?;
        let usage = report.map(|r| clamp_percent(r.percent));
        debug!(path = %self.path.display(), usage = ?usage, "read usage report");
        Ok(usage)
    }
}

fn clamp_percent(value: f64) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.round().clamp(0.0, 100.0) as u8
}

/// Atomically write a usage report.
pub fn write_usage(path: &std::path::Path, percent: f64) -> Result<()> {
    if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
        return Err(anyhow!("usage percent must be within 0..=100 (got {percent})"));
    }
    write_json_atomic(path, &UsageReport { percent })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_report_is_unknown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = FileUsageSource::new(temp.path().join("usage.json"));
        assert_eq!(source.current_usage().expect("read"), None);
    }

    #[test]
    fn written_report_is_read_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".auto/context_usage.json");
        write_usage(&path, 82.4).expect("write");
        let source = FileUsageSource::new(&path);
        assert_eq!(source.current_usage().expect("read"), Some(82));
    }

    #[test]
    fn out_of_range_values_are_clamped_on_read_and_rejected_on_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("usage.json");
        std::fs::write(&path, "{\"percent\": 140}").expect("write");
        assert_eq!(FileUsageSource::new(&path).current_usage().expect("read"), Some(100));
        assert!(write_usage(&path, 101.0).is_err());
    }
}
