//! Tier 1: broken builds and tests, merge conflicts, security findings.

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::core::priority::{Priority, Tier};
use crate::core::types::{Complexity, DiscoveredTask};
use crate::discovery::{Environment, Probe, ellipsize, new_task};

/// Unresolved merge conflicts in the working tree.
pub struct MergeConflicts;

impl Probe for MergeConflicts {
    fn id(&self) -> &'static str {
        "merge-conflicts"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Urgent, 0)
    }

    fn task_type(&self) -> &'static str {
        "debug"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        let conflicted: Vec<String> = env
            .git()
            .status_porcelain()?
            .into_iter()
            .filter(|entry| entry.is_unmerged())
            .map(|entry| entry.path)
            .collect();
        let Some(first) = conflicted.first() else {
            return Ok(None);
        };
        let mut task = new_task(
            self,
            "merge conflict",
            format!("Resolve merge conflicts ({} files)", conflicted.len()),
            format!("/debug 'resolve merge conflicts starting with {first}'"),
        );
        task.description = format!("Unmerged paths: {}", conflicted.join(", "));
        task.affected_files = conflicted.len() as u32;
        task.complexity = if conflicted.len() > 3 {
            Complexity::High
        } else {
            Complexity::Medium
        };
        task.details = Some(json!({ "files": conflicted }));
        Ok(Some(task))
    }
}

/// Configured build command exits nonzero.
pub struct BuildBroken;

impl Probe for BuildBroken {
    fn id(&self) -> &'static str {
        "build-broken"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Urgent, 1)
    }

    fn task_type(&self) -> &'static str {
        "check_fix"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        let Some(command) = &env.config.build_command else {
            return Ok(None);
        };
        let result = env.run(command)?;
        if result.success() {
            return Ok(None);
        }
        let command_line = command.join(" ");
        let first_error = result
            .combined()
            .lines()
            .find(|line| line.to_lowercase().contains("error"))
            .map(|line| ellipsize(line.trim(), 120));
        let mut task = new_task(
            self,
            "build",
            "Fix the broken build",
            format!("/check --fix '{command_line}'"),
        );
        task.description = match &first_error {
            Some(line) => format!("`{command_line}` failed: {line}"),
            None => format!("`{command_line}` failed (exit {:?})", result.exit_code),
        };
        task.details = Some(json!({
            "command": command_line,
            "exit_code": result.exit_code,
            "timed_out": result.timed_out,
        }));
        Ok(Some(task))
    }
}

/// Test runner's last-failure cache lists failures.
pub struct TestFailures;

impl Probe for TestFailures {
    fn id(&self) -> &'static str {
        "test-failures"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Urgent, 2)
    }

    fn task_type(&self) -> &'static str {
        "debug_simple"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        for cache in &env.config.test_failure_caches {
            let Some(contents) = env.read_file(cache)? else {
                continue;
            };
            let trimmed = contents.trim();
            if trimmed.is_empty() || trimmed == "{}" {
                continue;
            }
            let failed = failed_test_ids(trimmed);
            let mut files: Vec<&str> = failed
                .iter()
                .map(|id| id.split("::").next().unwrap_or(id.as_str()))
                .collect();
            files.sort_unstable();
            files.dedup();

            let mut task = new_task(
                self,
                "test failure",
                format!("Fix failing tests ({})", failed.len().max(1)),
                "/debug 'rerun the last failed tests and fix them'",
            );
            task.description = match failed.first() {
                Some(first) => format!("Last run failed, starting with {first}"),
                None => format!("{cache} records failures from the last run"),
            };
            task.affected_files = files.len().max(1) as u32;
            task.complexity = if failed.len() > 10 {
                Complexity::High
            } else {
                Complexity::Medium
            };
            task.details = Some(json!({ "cache": cache, "failed": failed }));
            return Ok(Some(task));
        }
        Ok(None)
    }
}

/// Keys of a JSON object cache (`{"tests/a.py::test_x": true}`); empty for other formats.
fn failed_test_ids(contents: &str) -> Vec<String> {
    match serde_json::from_str::<Value>(contents) {
        Ok(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// Dependency audit reports known vulnerabilities.
pub struct SecurityAudit;

impl Probe for SecurityAudit {
    fn id(&self) -> &'static str {
        "security-audit"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Urgent, 3)
    }

    fn task_type(&self) -> &'static str {
        "check_security"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        let Some(command) = &env.config.audit_command else {
            return Ok(None);
        };
        let result = env.run(command)?;
        let stdout = result.stdout.trim();
        if stdout.is_empty() {
            return Ok(None);
        }
        let report: Value = serde_json::from_str(stdout).context("parse audit report")?;
        let count = count_vulnerabilities(&report);
        if count == 0 {
            return Ok(None);
        }
        let mut task = new_task(
            self,
            "security",
            format!("Fix security vulnerabilities ({count})"),
            "/check --security --fix",
        );
        task.description = format!("`{}` reported {count} vulnerabilities", command.join(" "));
        task.complexity = Complexity::High;
        task.details = Some(json!({ "vulnerabilities": count }));
        Ok(Some(task))
    }
}

/// Count findings across common audit formats.
///
/// - `[{...}, ...]`: one finding per element
/// - `{"dependencies": [{"vulns": [...]}]}` (pip-audit)
/// - `{"vulnerabilities": [...] | {...}}` (npm audit, cargo audit style)
pub(crate) fn count_vulnerabilities(report: &Value) -> usize {
    match report {
        Value::Array(items) => items.len(),
        Value::Object(map) => {
            if let Some(Value::Array(deps)) = map.get("dependencies") {
                return deps
                    .iter()
                    .map(|dep| dep.get("vulns").and_then(Value::as_array).map_or(0, Vec::len))
                    .sum();
            }
            match map.get("vulnerabilities") {
                Some(Value::Array(items)) => items.len(),
                Some(Value::Object(inner)) => match inner.get("list") {
                    Some(Value::Array(items)) => items.len(),
                    _ => inner.len(),
                },
                _ => 0,
            }
        }
        _ => 0,
    }
}
