//! Tier 4: autonomous improvement (lint, coverage, docs, TODOs, dependencies).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde_json::{Value, json};

use crate::core::priority::{Priority, Tier};
use crate::core::types::{Complexity, DiscoveredTask};
use crate::discovery::{Environment, Probe, ellipsize, fan_out, new_task};

/// Run a tool that prints a JSON array; exit status is ignored because
/// linters and outdated checks exit nonzero when they have findings.
fn run_json_array(env: &Environment<'_>, argv: &[String]) -> Result<Vec<Value>> {
    let result = env.run(argv)?;
    if result.timed_out {
        return Err(anyhow!("{} timed out", argv.join(" ")));
    }
    let stdout = result.stdout.trim();
    if stdout.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str(stdout).with_context(|| format!("parse {} output", argv[0]))? {
        Value::Array(items) => Ok(items),
        other => Err(anyhow!("expected a JSON array, got {}", type_name(&other))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Lint findings above a warning threshold.
pub struct LintDebt;

impl Probe for LintDebt {
    fn id(&self) -> &'static str {
        "lint-debt"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Improvement, 0)
    }

    fn task_type(&self) -> &'static str {
        "check_fix"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        let Some(command) = &env.config.lint_command else {
            return Ok(None);
        };
        let findings = run_json_array(env, command)?;
        if findings.len() <= env.config.lint_warning_threshold {
            return Ok(None);
        }
        let mut by_file: BTreeMap<String, usize> = BTreeMap::new();
        for finding in &findings {
            let file = ["filename", "file", "path"]
                .iter()
                .find_map(|key| finding.get(*key).and_then(Value::as_str))
                .unwrap_or("unknown");
            *by_file.entry(file.to_string()).or_default() += 1;
        }
        // Ties resolve to the first file in sorted order.
        let (worst_file, worst_count) = by_file
            .iter()
            .fold(("", 0usize), |best, (file, count)| {
                if *count > best.1 { (file.as_str(), *count) } else { best }
            });

        let mut task = new_task(
            self,
            "code quality",
            format!("Fix lint findings ({})", findings.len()),
            format!("/check --fix '{}'", command.join(" ")),
        );
        task.description = format!("Most findings: {worst_file} ({worst_count})");
        task.affected_files = by_file.len() as u32;
        task.parallel_agents = fan_out(by_file.len());
        task.complexity = Complexity::Low;
        task.details = Some(json!({
            "total": findings.len(),
            "by_file": by_file.iter().take(5).collect::<BTreeMap<_, _>>(),
        }));
        Ok(Some(task))
    }
}

/// Coverage report totals below the floor; targets the least-covered file.
pub struct CoverageGap;

impl Probe for CoverageGap {
    fn id(&self) -> &'static str {
        "coverage-gap"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Improvement, 1)
    }

    fn task_type(&self) -> &'static str {
        "tdd_simple"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        let Some(contents) = env.read_file(&env.config.coverage_report)? else {
            return Ok(None);
        };
        let report: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", env.config.coverage_report))?;
        let Some(total) = report
            .pointer("/totals/percent_covered")
            .and_then(Value::as_f64)
        else {
            return Ok(None);
        };
        if total >= env.config.coverage_floor {
            return Ok(None);
        }

        let mut low: Vec<(String, f64)> = report
            .get("files")
            .and_then(Value::as_object)
            .map(|files| {
                files
                    .iter()
                    .filter_map(|(name, info)| {
                        let pct = info.pointer("/summary/percent_covered")?.as_f64()?;
                        (pct < env.config.coverage_file_floor).then(|| (name.clone(), pct))
                    })
                    .collect()
            })
            .unwrap_or_default();
        low.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let Some((worst, worst_pct)) = low.first().cloned() else {
            return Ok(None);
        };

        let mut task = new_task(
            self,
            "test coverage",
            format!("Raise coverage ({total:.1}%)"),
            format!("/work 'add tests: {worst}'"),
        );
        task.description = format!("Lowest file: {worst} ({worst_pct:.1}%)");
        task.affected_files = low.len() as u32;
        task.parallel_agents = fan_out(low.len());
        task.details = Some(json!({
            "total": total,
            "low_files": low.iter().take(5).map(|(f, p)| json!({"file": f, "percent": p})).collect::<Vec<_>>(),
        }));
        Ok(Some(task))
    }
}

/// Relative paths (with `/` separators) of files under `dir` whose name
/// matches `pattern`, sorted. Hidden directories are skipped.
fn source_files(root: &Path, dir: &str, pattern: &Regex) -> Result<Vec<String>> {
    let mut found = Vec::new();
    let mut pending = vec![root.join(dir)];
    while let Some(current) = pending.pop() {
        let entries =
            fs::read_dir(&current).with_context(|| format!("read {}", current.display()))?;
        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if path.is_dir() {
                if !name.starts_with('.') {
                    pending.push(path);
                }
            } else if pattern.is_match(&name)
                && let Ok(relative) = path.strip_prefix(root)
            {
                let parts: Vec<_> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                found.push(parts.join("/"));
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Source files that define functions or classes but carry no doc comment.
pub struct MissingDocs;

impl Probe for MissingDocs {
    fn id(&self) -> &'static str {
        "missing-docs"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Improvement, 2)
    }

    fn task_type(&self) -> &'static str {
        "docs_update"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        if !env.path(&env.config.docs_source_dir).is_dir() {
            return Ok(None);
        }
        let file_pattern =
            Regex::new(&env.config.docs_file_pattern).context("compile docs_file_pattern")?;
        let definition = Regex::new(&env.config.docs_definition_pattern)
            .context("compile docs_definition_pattern")?;

        let mut undocumented = Vec::new();
        for file in source_files(env.root, &env.config.docs_source_dir, &file_pattern)? {
            // Unreadable or non-UTF-8 files are not source we can judge.
            let Ok(Some(contents)) = env.read_file(&file) else {
                continue;
            };
            let documented = env
                .config
                .docs_markers
                .iter()
                .any(|marker| contents.contains(marker.as_str()));
            if !documented && definition.is_match(&contents) {
                undocumented.push(file);
            }
        }
        let Some(first) = undocumented.first() else {
            return Ok(None);
        };

        let mut task = new_task(
            self,
            "documentation",
            format!("Add docs ({} files)", undocumented.len()),
            format!("/work 'add docs: {first}'"),
        );
        task.description = format!("Needs docs: {first}");
        task.affected_files = undocumented.len() as u32;
        task.parallel_agents = fan_out(undocumented.len());
        task.complexity = Complexity::Low;
        task.details = Some(json!({
            "files": undocumented.iter().take(10).collect::<Vec<_>>(),
        }));
        Ok(Some(task))
    }
}

/// Long-lived TODO/FIXME/HACK/XXX comments in tracked files.
pub struct TodoComments;

impl Probe for TodoComments {
    fn id(&self) -> &'static str {
        "todo-comments"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Improvement, 3)
    }

    fn task_type(&self) -> &'static str {
        "docs_update"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        let hits = env.git().grep(
            "(TODO|FIXME|HACK|XXX):",
            &env.config.todo_pathspecs,
            env.config.todo_limit,
        )?;
        let Some(first) = hits.first() else {
            return Ok(None);
        };
        let mut files: Vec<&str> = hits.iter().map(|h| h.file.as_str()).collect();
        files.sort_unstable();
        files.dedup();

        let mut task = new_task(
            self,
            "refactoring",
            format!("Resolve TODO comments ({})", hits.len()),
            format!("/work 'resolve TODO: {}:{}'", first.file, first.line),
        );
        task.description = format!(
            "{}:{} - {}",
            first.file,
            first.line,
            ellipsize(&first.content, 40)
        );
        task.affected_files = files.len() as u32;
        task.complexity = Complexity::Low;
        task.details = Some(json!({
            "todos": hits
                .iter()
                .map(|h| json!({"file": h.file, "line": h.line, "content": h.content}))
                .collect::<Vec<_>>(),
        }));
        Ok(Some(task))
    }
}

/// Outdated dependencies reported by a package manager.
pub struct OutdatedDependencies;

impl Probe for OutdatedDependencies {
    fn id(&self) -> &'static str {
        "outdated-dependencies"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Improvement, 4)
    }

    fn task_type(&self) -> &'static str {
        "solution_migration"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        let Some(command) = &env.config.outdated_command else {
            return Ok(None);
        };
        let packages = run_json_array(env, command)?;
        if packages.is_empty() {
            return Ok(None);
        }
        let names: Vec<&str> = packages
            .iter()
            .filter_map(|p| p.get("name").and_then(Value::as_str))
            .collect();
        let mut task = new_task(
            self,
            "dependencies",
            format!("Update outdated dependencies ({})", packages.len()),
            format!(
                "/work 'upgrade dependencies: {}'",
                names.iter().take(5).copied().collect::<Vec<_>>().join(", ")
            ),
        );
        task.description = format!("`{}` lists {} packages", command.join(" "), packages.len());
        task.complexity = Complexity::High;
        task.details = Some(json!({ "packages": names }));
        Ok(Some(task))
    }
}
