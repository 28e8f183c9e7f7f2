//! Orchestrator configuration stored in `.auto/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::atomic::write_atomic;
use crate::core::budget::BudgetThresholds;

/// Orchestrator configuration (TOML).
///
/// Intended to be edited by humans. Every section and field is optional and
/// falls back to the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoConfig {
    #[serde(rename = "loop")]
    pub looping: LoopConfig,
    pub budget: BudgetConfig,
    pub executor: ExecutorConfig,
    pub validation: ValidationConfig,
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Consecutive failed iterations before the loop gives up.
    pub max_consecutive_failures: u32,
    /// Pause between iterations.
    pub cooldown_secs: u64,
    /// Sleep when discovery finds nothing to do.
    pub idle_backoff_secs: u64,
    pub executor_timeout_secs: u64,
    /// Truncate executor output (memory and iteration logs) beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            cooldown_secs: 5,
            idle_backoff_secs: 30,
            executor_timeout_secs: 600,
            output_limit_bytes: 200_000,
        }
    }
}

impl LoopConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_secs(self.idle_backoff_secs)
    }

    pub fn executor_timeout(&self) -> Duration {
        Duration::from_secs(self.executor_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BudgetConfig {
    /// Usage at which the predictor is consulted before dispatching a task.
    pub prepare_threshold: u8,
    /// Usage at which the loop stops for cleanup unconditionally.
    pub critical_threshold: u8,
    /// Largest single task (percent) admitted without cleanup.
    pub comfort_margin: u32,
    /// JSON usage report written by an external monitor (`{"percent": N}`).
    pub usage_file: String,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            prepare_threshold: 80,
            critical_threshold: 90,
            comfort_margin: 20,
            usage_file: ".auto/context_usage.json".to_string(),
        }
    }
}

impl BudgetConfig {
    pub fn thresholds(&self) -> BudgetThresholds {
        let defaults = BudgetThresholds::default();
        BudgetThresholds {
            monitor: defaults.monitor.min(self.prepare_threshold),
            prepare: self.prepare_threshold,
            warning: defaults.warning.clamp(self.prepare_threshold, self.critical_threshold),
            critical: self.critical_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Agent command; the task command is appended as the final argument.
    pub command: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    pub timeout_secs: u64,
    /// Coverage percentage below which a shortfall is recorded.
    pub coverage_floor: f64,
    /// Coverage report read after `coverage_command` runs.
    pub coverage_report: String,
    /// End-to-end check (e.g. `["npx","playwright","test"]`). Unset means vacuous pass.
    pub functional_command: Option<Vec<String>>,
    /// Command that refreshes `coverage_report`. Unset means read the report as is.
    pub coverage_command: Option<Vec<String>>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            coverage_floor: 80.0,
            coverage_report: "coverage.json".to_string(),
            functional_command: None,
            coverage_command: None,
        }
    }
}

impl ValidationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub probe_timeout_secs: u64,
    /// Probe ids skipped by the cascade and the report.
    pub disabled_probes: Vec<String>,
    /// Last-failure cache files of test runners.
    pub test_failure_caches: Vec<String>,
    /// Changed lines (added + removed) that count as pending work.
    pub uncommitted_line_threshold: u32,
    /// Ticket-tracker CLI (`gh`-compatible).
    pub tracker_program: String,
    pub issue_limit: u32,
    pub planning_dir: String,
    /// Regex matched against planning document file names.
    pub planning_file_pattern: String,
    pub checklist_files: Vec<String>,
    /// Lint findings above which lint debt is reported.
    pub lint_warning_threshold: usize,
    pub coverage_report: String,
    pub coverage_floor: f64,
    /// Per-file coverage below which a file is a candidate.
    pub coverage_file_floor: f64,
    /// Directory searched (recursively) for undocumented source files.
    pub docs_source_dir: String,
    /// Regex matched against source file names under `docs_source_dir`.
    pub docs_file_pattern: String,
    /// Regex for a function or class definition.
    pub docs_definition_pattern: String,
    /// A file containing any of these strings counts as documented.
    pub docs_markers: Vec<String>,
    /// Pathspecs for the TODO-comment search; empty means the whole repository.
    pub todo_pathspecs: Vec<String>,
    pub todo_limit: usize,
    /// Completed tasks between retrospective passes.
    pub retrospective_interval: u32,
    /// Exits nonzero when the build is broken.
    pub build_command: Option<Vec<String>>,
    /// JSON vulnerability report (e.g. `["pip-audit","--format","json"]`).
    pub audit_command: Option<Vec<String>>,
    /// JSON array of lint findings (e.g. `["ruff","check","--output-format","json"]`).
    pub lint_command: Option<Vec<String>>,
    /// JSON array of outdated packages (e.g. `["pip","list","--outdated","--format","json"]`).
    pub outdated_command: Option<Vec<String>>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 30,
            disabled_probes: Vec::new(),
            test_failure_caches: vec![".pytest_cache/v/cache/lastfailed".to_string()],
            uncommitted_line_threshold: 1,
            tracker_program: "gh".to_string(),
            issue_limit: 5,
            planning_dir: "tasks/prds".to_string(),
            planning_file_pattern: r"-prd-.*\.md$".to_string(),
            checklist_files: vec!["TODO.md".to_string(), "docs/CHECKLIST.md".to_string()],
            lint_warning_threshold: 0,
            coverage_report: "coverage.json".to_string(),
            coverage_floor: 80.0,
            coverage_file_floor: 60.0,
            docs_source_dir: "src".to_string(),
            docs_file_pattern: r"^[^_].*\.py$".to_string(),
            docs_definition_pattern: r"(?m)^\s*(async\s+def|def|class)\s+\w+".to_string(),
            docs_markers: vec!["\"\"\"".to_string(), "'''".to_string()],
            todo_pathspecs: Vec::new(),
            todo_limit: 20,
            retrospective_interval: 10,
            build_command: None,
            audit_command: None,
            lint_command: None,
            outdated_command: None,
        }
    }
}

impl DiscoveryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn is_enabled(&self, probe_id: &str) -> bool {
        !self.disabled_probes.iter().any(|id| id == probe_id)
    }
}

impl AutoConfig {
    pub fn validate(&self) -> Result<()> {
        let l = &self.looping;
        if l.executor_timeout_secs == 0 {
            return Err(anyhow!("loop.executor_timeout_secs must be > 0"));
        }
        if l.output_limit_bytes == 0 {
            return Err(anyhow!("loop.output_limit_bytes must be > 0"));
        }
        if l.max_consecutive_failures == 0 {
            return Err(anyhow!("loop.max_consecutive_failures must be > 0"));
        }

        let b = &self.budget;
        if b.critical_threshold > 100 || b.prepare_threshold > 100 {
            return Err(anyhow!("budget thresholds must be within 0..=100"));
        }
        if b.prepare_threshold >= b.critical_threshold {
            return Err(anyhow!(
                "budget.prepare_threshold ({}) must be below budget.critical_threshold ({})",
                b.prepare_threshold,
                b.critical_threshold
            ));
        }
        if b.comfort_margin == 0 || b.comfort_margin > 100 {
            return Err(anyhow!("budget.comfort_margin must be within 1..=100"));
        }

        validate_command("executor.command", Some(&self.executor.command))?;

        let v = &self.validation;
        if v.timeout_secs == 0 {
            return Err(anyhow!("validation.timeout_secs must be > 0"));
        }
        validate_percent("validation.coverage_floor", v.coverage_floor)?;
        validate_command("validation.functional_command", v.functional_command.as_ref())?;
        validate_command("validation.coverage_command", v.coverage_command.as_ref())?;

        let d = &self.discovery;
        if d.probe_timeout_secs == 0 {
            return Err(anyhow!("discovery.probe_timeout_secs must be > 0"));
        }
        validate_percent("discovery.coverage_floor", d.coverage_floor)?;
        validate_percent("discovery.coverage_file_floor", d.coverage_file_floor)?;
        for (name, pattern) in [
            ("discovery.planning_file_pattern", &d.planning_file_pattern),
            ("discovery.docs_file_pattern", &d.docs_file_pattern),
            ("discovery.docs_definition_pattern", &d.docs_definition_pattern),
        ] {
            regex::Regex::new(pattern).with_context(|| format!("{name} must be a valid regex"))?;
        }
        if d.docs_markers.iter().any(String::is_empty) {
            return Err(anyhow!("discovery.docs_markers must not contain empty strings"));
        }
        for (name, cmd) in [
            ("discovery.build_command", &d.build_command),
            ("discovery.audit_command", &d.audit_command),
            ("discovery.lint_command", &d.lint_command),
            ("discovery.outdated_command", &d.outdated_command),
        ] {
            validate_command(name, cmd.as_ref())?;
        }
        Ok(())
    }
}

fn validate_command(name: &str, command: Option<&Vec<String>>) -> Result<()> {
    match command {
        Some(cmd) if cmd.first().is_none_or(|program| program.trim().is_empty()) => {
            Err(anyhow!("{name} must be a non-empty array"))
        }
        _ => Ok(()),
    }
}

fn validate_percent(name: &str, value: f64) -> Result<()> {
    if !(0.0..=100.0).contains(&value) {
        return Err(anyhow!("{name} must be within 0..=100 (got {value})"));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AutoConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutoConfig> {
    if !path.exists() {
        let cfg = AutoConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AutoConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AutoConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
