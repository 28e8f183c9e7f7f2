//! Tier 3: planned development work from tracked documents.

use std::fs;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::json;

use crate::core::priority::{Priority, Tier};
use crate::core::types::{Complexity, DiscoveredTask};
use crate::discovery::{Environment, Probe, ellipsize, new_task};

static CHECKBOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*[-*][ \t]+\[([ xX])\][ \t]*(.*)$").expect("checkbox regex should be valid")
});

/// Checked/unchecked items of a checklist document, in document order.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Checklist {
    pub checked: usize,
    pub unchecked: Vec<String>,
}

pub(crate) fn parse_checklist(contents: &str) -> Checklist {
    let mut list = Checklist::default();
    for caps in CHECKBOX_RE.captures_iter(contents) {
        if &caps[1] == " " {
            list.unchecked.push(caps[2].trim().to_string());
        } else {
            list.checked += 1;
        }
    }
    list
}

/// Planning document that is in progress (some items checked, some not).
pub struct PlanningDocument;

impl Probe for PlanningDocument {
    fn id(&self) -> &'static str {
        "planning-document"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Development, 0)
    }

    fn task_type(&self) -> &'static str {
        "tdd"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        let dir = env.path(&env.config.planning_dir);
        if !dir.is_dir() {
            return Ok(None);
        }
        let pattern = Regex::new(&env.config.planning_file_pattern)
            .context("compile planning_file_pattern")?;
        let mut names: Vec<String> = fs::read_dir(&dir)
            .with_context(|| format!("read {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| pattern.is_match(name))
            .collect();
        names.sort();

        for name in names {
            let relative = format!("{}/{name}", env.config.planning_dir.trim_end_matches('/'));
            let Some(contents) = env.read_file(&relative)? else {
                continue;
            };
            let list = parse_checklist(&contents);
            if list.checked == 0 || list.unchecked.is_empty() {
                continue;
            }
            let total = list.checked + list.unchecked.len();
            let next = list.unchecked[0].clone();
            let mut task = new_task(
                self,
                "planning",
                format!("Continue {name}: {}", ellipsize(&next, 50)),
                format!("/work 'continue {relative}: {next}'"),
            );
            task.description = format!("{}/{total} items done", list.checked);
            task.affected_files = list.unchecked.len().min(10) as u32;
            task.complexity = Complexity::Medium;
            task.details = Some(json!({
                "path": relative,
                "checked": list.checked,
                "unchecked": list.unchecked.len(),
            }));
            return Ok(Some(task));
        }
        Ok(None)
    }
}

/// Unchecked items in plain checklist files (`TODO.md`, `docs/CHECKLIST.md`).
pub struct PlannedTodos;

impl Probe for PlannedTodos {
    fn id(&self) -> &'static str {
        "planned-todos"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Development, 1)
    }

    fn task_type(&self) -> &'static str {
        "research_plan"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        for file in &env.config.checklist_files {
            let Some(contents) = env.read_file(file)? else {
                continue;
            };
            let list = parse_checklist(&contents);
            let Some(first) = list.unchecked.first() else {
                continue;
            };
            let mut task = new_task(
                self,
                "planned",
                ellipsize(first, 50),
                format!("/work '{first}'"),
            );
            task.description = format!("{} open items in {file}", list.unchecked.len());
            task.complexity = Complexity::Low;
            task.details = Some(json!({
                "file": file,
                "todos": list.unchecked.iter().take(5).collect::<Vec<_>>(),
            }));
            return Ok(Some(task));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ProbeFixture;

    #[test]
    fn checklist_parsing_handles_both_markers() {
        let list = parse_checklist("# Plan\n- [x] one\n* [X] two\n- [ ] three\n  - [ ] four\nnot - [ ] this\n");
        assert_eq!(list.checked, 2);
        assert_eq!(list.unchecked, vec!["three".to_string(), "four".to_string()]);
    }

    #[test]
    fn in_progress_planning_document_is_found() {
        let fixture = ProbeFixture::new();
        fixture.write_file("tasks/prds/0001-prd-new.md", "- [ ] not started\n");
        fixture.write_file("tasks/prds/0002-prd-auth.md", "- [x] schema\n- [ ] login form\n");
        fixture.write_file("tasks/prds/notes.md", "- [x] a\n- [ ] b\n");

        let task = fixture.check(&PlanningDocument).expect("check").expect("task");
        assert_eq!(task.title, "Continue 0002-prd-auth.md: login form");
        assert_eq!(task.description, "1/2 items done");
    }

    #[test]
    fn untouched_or_finished_documents_are_skipped() {
        let fixture = ProbeFixture::new();
        fixture.write_file("tasks/prds/0001-prd-new.md", "- [ ] not started\n");
        fixture.write_file("tasks/prds/0003-prd-done.md", "- [x] all done\n");
        assert!(fixture.check(&PlanningDocument).expect("check").is_none());
    }

    #[test]
    fn planned_todos_use_first_file_with_open_items() {
        let fixture = ProbeFixture::new();
        fixture.write_file("TODO.md", "- [x] shipped\n");
        fixture.write_file("docs/CHECKLIST.md", "- [ ] write release notes\n- [ ] tag\n");
        let task = fixture.check(&PlannedTodos).expect("check").expect("task");
        assert_eq!(task.command, "/work 'write release notes'");
        assert_eq!(task.description, "2 open items in docs/CHECKLIST.md");
    }
}
