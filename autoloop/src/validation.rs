//! Post-task validation: functional tests first, coverage second.
//!
//! Functional validation gates the iteration. On failure the loop hands a
//! `/debug` task to the executor and re-runs functional validation exactly
//! once. Coverage is advisory: a shortfall is recorded, never fatal. A
//! validator whose tool is missing passes vacuously with the reason recorded.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::types::{DiscoveredTask, ValidationKind, ValidationResult};
use crate::io::config::ValidationConfig;
use crate::io::executor::{ExecRequest, Executor};
use crate::io::process::{CommandRunner, CommandSpec, is_not_found};
use crate::io::prompt::render_debug_prompt;

/// Bytes of validator output kept in a failing result.
const ERROR_TAIL_BYTES: usize = 4_000;

static PASSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) passed").expect("valid passed regex"));
static FAILED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) failed").expect("valid failed regex"));

/// Runs the project's validators.
pub trait Validator {
    fn run_functional_validation(&self) -> ValidationResult;
    fn run_coverage_validation(&self) -> ValidationResult;
}

/// Validator backed by configured commands and a coverage JSON report.
pub struct CommandValidator<'a> {
    runner: &'a dyn CommandRunner,
    root: &'a Path,
    config: &'a ValidationConfig,
}

impl<'a> CommandValidator<'a> {
    pub fn new(runner: &'a dyn CommandRunner, root: &'a Path, config: &'a ValidationConfig) -> Self {
        Self {
            runner,
            root,
            config,
        }
    }

    fn run(&self, kind: ValidationKind, argv: &[String]) -> Result<String, ValidationResult> {
        let spec = match CommandSpec::from_argv(argv, self.root) {
            Ok(spec) => spec.timeout(self.config.timeout()),
            Err(err) => return Err(ValidationResult::failed(kind, format!("{err:#}"))),
        };
        match self.runner.run(&spec) {
            Ok(result) if result.timed_out => Err(ValidationResult::failed(
                kind,
                format!("{} timed out after {}s", spec.display(), spec.timeout.as_secs()),
            )),
            Ok(result) if result.success() => Ok(result.combined()),
            Ok(result) => {
                let output = result.combined();
                let (passed, failed) = parse_counts(&output);
                Err(ValidationResult {
                    passed: false,
                    kind,
                    total: passed + failed,
                    passed_count: passed,
                    failed_count: failed,
                    coverage_percent: None,
                    error: Some(tail(output.trim(), ERROR_TAIL_BYTES).to_string()),
                })
            }
            Err(err) if is_not_found(&err) => {
                Err(ValidationResult::vacuous(kind, format!("{err:#}")))
            }
            Err(err) => Err(ValidationResult::failed(kind, format!("{err:#}"))),
        }
    }
}

impl Validator for CommandValidator<'_> {
    #[instrument(skip_all)]
    fn run_functional_validation(&self) -> ValidationResult {
        let Some(argv) = &self.config.functional_command else {
            return ValidationResult::vacuous(
                ValidationKind::Functional,
                "no functional validation command configured",
            );
        };
        match self.run(ValidationKind::Functional, argv) {
            Ok(output) => {
                let (passed, failed) = parse_counts(&output);
                ValidationResult {
                    passed: true,
                    kind: ValidationKind::Functional,
                    total: passed + failed,
                    passed_count: passed,
                    failed_count: failed,
                    coverage_percent: None,
                    error: None,
                }
            }
            Err(result) => result,
        }
    }

    #[instrument(skip_all)]
    fn run_coverage_validation(&self) -> ValidationResult {
        if let Some(argv) = &self.config.coverage_command
            && let Err(result) = self.run(ValidationKind::Coverage, argv)
        {
            return result;
        }
        let path = self.root.join(&self.config.coverage_report);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => {
                return ValidationResult::vacuous(
                    ValidationKind::Coverage,
                    format!("no coverage report at {}", path.display()),
                );
            }
        };
        let report: Value = match serde_json::from_str(&raw) {
            Ok(report) => report,
            Err(err) => {
                return ValidationResult::failed(
                    ValidationKind::Coverage,
                    format!("parse {}: {err}", path.display()),
                );
            }
        };
        coverage_result(&report, self.config.coverage_floor)
    }
}

fn coverage_result(report: &Value, floor: f64) -> ValidationResult {
    let totals = &report["totals"];
    let Some(percent) = totals["percent_covered"].as_f64() else {
        return ValidationResult::failed(
            ValidationKind::Coverage,
            "coverage report has no totals.percent_covered",
        );
    };
    let count = |key: &str| {
        totals[key]
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };
    let passed = percent >= floor;
    ValidationResult {
        passed,
        kind: ValidationKind::Coverage,
        total: count("num_statements"),
        passed_count: count("covered_lines"),
        failed_count: count("missing_lines"),
        coverage_percent: Some(percent),
        error: (!passed).then(|| format!("coverage {percent:.1}% is below the {floor:.1}% floor")),
    }
}

/// Extract `N passed` / `N failed` counters from test-runner output.
pub fn parse_counts(output: &str) -> (u32, u32) {
    let sum = |re: &Regex| {
        re.captures_iter(output)
            .filter_map(|caps| caps[1].parse::<u32>().ok())
            .fold(0u32, u32::saturating_add)
    };
    (sum(&PASSED_RE), sum(&FAILED_RE))
}

fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Outcome of the full validation protocol for one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    /// Functional validation passed (possibly after one debug round).
    pub passed: bool,
    /// Every validator run, in order.
    pub results: Vec<ValidationResult>,
    pub debug_triggered: bool,
    pub coverage_shortfall: bool,
}

/// Parameters for executor calls made on behalf of validation.
pub struct DebugTarget<'a> {
    pub executor: &'a dyn Executor,
    pub workdir: &'a Path,
    pub timeout: std::time::Duration,
    pub output_limit_bytes: usize,
}

/// Drives validators and the debug retry for one task.
pub struct ValidationSubsystem<'a> {
    validator: &'a dyn Validator,
    debug: DebugTarget<'a>,
}

impl<'a> ValidationSubsystem<'a> {
    pub fn new(validator: &'a dyn Validator, debug: DebugTarget<'a>) -> Self {
        Self { validator, debug }
    }

    /// Hand a `/debug` task describing `failure` to the executor.
    ///
    /// Returns whether the executor reported success. Executor errors are
    /// logged and count as an unsuccessful debug round.
    pub fn trigger_debug(&self, task: &DiscoveredTask, failure: &ValidationResult) -> bool {
        let prompt = match render_debug_prompt(task, std::slice::from_ref(failure)) {
            Ok(prompt) => prompt,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "render debug prompt");
                return false;
            }
        };
        let request = ExecRequest {
            workdir: self.debug.workdir.to_path_buf(),
            command: prompt,
            timeout: self.debug.timeout,
            output_limit_bytes: self.debug.output_limit_bytes,
            stream_path: None,
            cancel: None,
        };
        match self.debug.executor.exec(&request) {
            Ok(output) => output.success,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "debug executor failed");
                false
            }
        }
    }

    /// Functional, then (on failure) one debug round and one re-run, then coverage.
    #[instrument(skip_all, fields(task = %task.title))]
    pub fn validate(&self, task: &DiscoveredTask) -> ValidationReport {
        let mut results = Vec::new();
        let mut debug_triggered = false;

        let mut functional = self.validator.run_functional_validation();
        results.push(functional.clone());
        if !functional.passed {
            info!("functional validation failed; starting debug round");
            debug_triggered = true;
            let debugged = self.trigger_debug(task, &functional);
            info!(debugged, "re-running functional validation");
            functional = self.validator.run_functional_validation();
            results.push(functional.clone());
        }
        if !functional.passed {
            return ValidationReport {
                passed: false,
                results,
                debug_triggered,
                coverage_shortfall: false,
            };
        }

        let coverage = self.validator.run_coverage_validation();
        let coverage_shortfall = !coverage.passed;
        if coverage_shortfall {
            warn!(error = ?coverage.error, "coverage below floor (advisory)");
        }
        results.push(coverage);
        ValidationReport {
            passed: true,
            results,
            debug_triggered,
            coverage_shortfall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::priority::{Priority, Tier};
    use crate::test_support::{
        ScriptedExecutor, ScriptedRunner, ScriptedValidator, exit_with, sample_task, stdout,
    };
    use std::time::Duration;

    fn config(functional: Option<&[&str]>) -> ValidationConfig {
        ValidationConfig {
            functional_command: functional.map(|argv| argv.iter().map(|s| s.to_string()).collect()),
            ..ValidationConfig::default()
        }
    }

    fn target(executor: &ScriptedExecutor) -> DebugTarget<'_> {
        DebugTarget {
            executor,
            workdir: Path::new("."),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
        }
    }

    #[test]
    fn counts_are_parsed_from_runner_output() {
        assert_eq!(parse_counts("=== 12 passed, 3 failed in 0.4s ==="), (12, 3));
        assert_eq!(parse_counts("nothing here"), (0, 0));
    }

    #[test]
    fn unconfigured_functional_validation_passes_vacuously() {
        let runner = ScriptedRunner::new();
        let cfg = config(None);
        let validator = CommandValidator::new(&runner, Path::new("."), &cfg);
        let result = validator.run_functional_validation();
        assert!(result.passed);
        assert_eq!(result.total, 0);
        assert!(result.error.is_some());
    }

    #[test]
    fn missing_test_tool_passes_vacuously() {
        let runner = ScriptedRunner::new();
        let cfg = config(Some(&["pytest", "-q"]));
        let validator = CommandValidator::new(&runner, Path::new("."), &cfg);
        let result = validator.run_functional_validation();
        assert!(result.passed);
        assert!(result.error.expect("reason").contains("pytest"));
    }

    #[test]
    fn failing_tests_produce_counts_and_output() {
        let runner = ScriptedRunner::new()
            .respond("pytest", exit_with(1, "FAILED test_a.py::test_x\n2 passed, 1 failed\n", ""));
        let cfg = config(Some(&["pytest", "-q"]));
        let validator = CommandValidator::new(&runner, Path::new("."), &cfg);
        let result = validator.run_functional_validation();
        assert!(!result.passed);
        assert_eq!((result.total, result.passed_count, result.failed_count), (3, 2, 1));
        assert!(result.error.expect("output").contains("test_x"));
    }

    #[test]
    fn passing_tests_report_counts() {
        let runner = ScriptedRunner::new().respond("pytest", stdout("5 passed in 0.1s\n"));
        let cfg = config(Some(&["pytest"]));
        let validator = CommandValidator::new(&runner, Path::new("."), &cfg);
        let result = validator.run_functional_validation();
        assert!(result.passed);
        assert_eq!(result.passed_count, 5);
        assert!(result.error.is_none());
    }

    #[test]
    fn coverage_reads_report_against_floor() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedRunner::new();
        let cfg = ValidationConfig {
            coverage_floor: 80.0,
            ..ValidationConfig::default()
        };
        let validator = CommandValidator::new(&runner, temp.path(), &cfg);
        assert!(validator.run_coverage_validation().passed, "missing report is vacuous");

        std::fs::write(
            temp.path().join("coverage.json"),
            r#"{"totals": {"percent_covered": 72.5, "num_statements": 200, "covered_lines": 145, "missing_lines": 55}}"#,
        )
        .expect("write");
        let result = validator.run_coverage_validation();
        assert!(!result.passed);
        assert_eq!(result.coverage_percent, Some(72.5));
        assert_eq!(result.total, 200);
        assert_eq!(result.failed_count, 55);
    }

    #[test]
    fn failure_triggers_one_debug_round_and_one_rerun() {
        let task = sample_task("test-failures", Priority::new(Tier::Urgent, 2));
        let validator = ScriptedValidator::new()
            .functional(ValidationResult::failed(ValidationKind::Functional, "1 failed"))
            .functional(ValidationResult::failed(ValidationKind::Functional, "1 failed"));
        let executor = ScriptedExecutor::succeeding();
        let subsystem = ValidationSubsystem::new(&validator, target(&executor));

        let report = subsystem.validate(&task);
        assert!(!report.passed);
        assert!(report.debug_triggered);
        assert_eq!(validator.functional_runs(), 2);
        assert_eq!(validator.coverage_runs(), 0);
        assert_eq!(executor.call_count(), 1);
        assert!(executor.commands()[0].starts_with("/debug"));
    }

    #[test]
    fn fixed_after_debug_continues_to_coverage() {
        let task = sample_task("test-failures", Priority::new(Tier::Urgent, 2));
        let validator = ScriptedValidator::new()
            .functional(ValidationResult::failed(ValidationKind::Functional, "1 failed"))
            .coverage(ValidationResult::failed(ValidationKind::Coverage, "low"));
        let executor = ScriptedExecutor::succeeding();
        let subsystem = ValidationSubsystem::new(&validator, target(&executor));

        let report = subsystem.validate(&task);
        assert!(report.passed);
        assert!(report.coverage_shortfall);
        assert_eq!(report.results.len(), 3);
    }

    #[test]
    fn passing_validation_never_calls_the_executor() {
        let task = sample_task("lint-debt", Priority::new(Tier::Improvement, 0));
        let validator = ScriptedValidator::new();
        let executor = ScriptedExecutor::succeeding();
        let report = ValidationSubsystem::new(&validator, target(&executor)).validate(&task);
        assert!(report.passed);
        assert!(!report.debug_triggered);
        assert_eq!(executor.call_count(), 0);
    }
}
