//! Read-only git queries used by probes and session bookkeeping.
//!
//! Every call goes through [`CommandRunner`], so tests can script git output.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::io::process::{CommandResult, CommandRunner, CommandSpec};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }

    /// Unresolved merge conflict (`DD`, `AU`, `UD`, `UA`, `DU`, `AA`, `UU`).
    pub fn is_unmerged(&self) -> bool {
        matches!(
            self.code.as_str(),
            "DD" | "AU" | "UD" | "UA" | "DU" | "AA" | "UU"
        )
    }

    /// Tracked file modified, added, deleted or renamed (staged or not).
    pub fn is_tracked_change(&self) -> bool {
        !self.is_untracked() && !self.is_unmerged() && self.code.trim() != "!!"
    }
}

/// Line counts from `git diff --numstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffStat {
    pub files: u32,
    pub added: u32,
    pub removed: u32,
}

impl DiffStat {
    pub fn changed_lines(&self) -> u32 {
        self.added + self.removed
    }
}

/// One `git grep -n` hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrepHit {
    pub file: String,
    pub line: u32,
    pub content: String,
}

/// Wrapper for executing git commands in a working directory.
pub struct Git<'a> {
    runner: &'a dyn CommandRunner,
    workdir: PathBuf,
    timeout: Duration,
}

impl<'a> Git<'a> {
    pub fn new(runner: &'a dyn CommandRunner, workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Get status entries (including untracked) in porcelain format.
    #[instrument(skip_all)]
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        debug!(entries = entries.len(), "git status");
        Ok(entries)
    }

    /// Changed lines of tracked files against `HEAD`.
    pub fn diff_numstat_head(&self) -> Result<DiffStat> {
        let out = self.run_capture(&["diff", "--numstat", "HEAD"])?;
        Ok(parse_numstat(&out))
    }

    /// Subject of the latest commit, `None` on an unborn branch.
    pub fn last_commit_subject(&self) -> Result<Option<String>> {
        let result = self.run(&["log", "-1", "--format=%s"])?;
        if !result.success() {
            return Ok(None);
        }
        let subject = result.stdout.trim();
        Ok((!subject.is_empty()).then(|| subject.to_string()))
    }

    /// Extended-regex search over tracked files. No match is an empty list.
    pub fn grep(&self, pattern: &str, pathspecs: &[String], limit: usize) -> Result<Vec<GrepHit>> {
        let mut args = vec!["grep", "-n", "-I", "-E", pattern];
        if !pathspecs.is_empty() {
            args.push("--");
            args.extend(pathspecs.iter().map(String::as_str));
        }
        let result = self.run(&args)?;
        match result.exit_code {
            Some(0) => Ok(result
                .stdout
                .lines()
                .filter_map(parse_grep_line)
                .take(limit)
                .collect()),
            Some(1) => Ok(Vec::new()),
            _ => Err(anyhow!("git grep failed: {}", result.stderr.trim())),
        }
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let result = self.run(args)?;
        if !result.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                result.stderr.trim()
            ));
        }
        Ok(result.stdout)
    }

    fn run(&self, args: &[&str]) -> Result<CommandResult> {
        let spec = CommandSpec::new("git", &self.workdir)
            .args(args.iter().copied())
            .timeout(self.timeout);
        self.runner.run(&spec)
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 || !line.is_char_boundary(2) || !line.is_char_boundary(3) {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn parse_numstat(out: &str) -> DiffStat {
    let mut stat = DiffStat::default();
    for line in out.lines() {
        let mut cols = line.split('\t');
        let (Some(added), Some(removed), Some(_path)) = (cols.next(), cols.next(), cols.next())
        else {
            continue;
        };
        stat.files += 1;
        // Binary files report "-".
        stat.added += added.parse::<u32>().unwrap_or(0);
        stat.removed += removed.parse::<u32>().unwrap_or(0);
    }
    stat
}

fn parse_grep_line(line: &str) -> Option<GrepHit> {
    let (file, rest) = line.split_once(':')?;
    let (line_no, content) = rest.split_once(':')?;
    Some(GrepHit {
        file: file.to_string(),
        line: line_no.parse().ok()?,
        content: content.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untracked_line() {
        let e = parse_status_line("?? foo.txt").expect("parse");
        assert!(e.is_untracked());
        assert_eq!(e.path, "foo.txt");
    }

    #[test]
    fn classifies_conflicts_and_tracked_changes() {
        let conflict = parse_status_line("UU src/lib.rs").expect("parse");
        assert!(conflict.is_unmerged());
        assert!(!conflict.is_tracked_change());
        let modified = parse_status_line(" M src/main.rs").expect("parse");
        assert!(modified.is_tracked_change());
        assert_eq!(modified.path, "src/main.rs");
    }

    #[test]
    fn parses_rename_line_uses_new_path() {
        let e = parse_status_line("R  old.txt -> new.txt").expect("parse");
        assert_eq!(e.path, "new.txt");
    }

    #[test]
    fn numstat_sums_lines_and_skips_binary_counts() {
        let stat = parse_numstat("3\t1\tsrc/a.rs\n-\t-\tlogo.png\n10\t0\tREADME.md\n");
        assert_eq!(stat.files, 3);
        assert_eq!(stat.changed_lines(), 14);
    }

    #[test]
    fn grep_line_keeps_colons_in_content() {
        let hit = parse_grep_line("src/a.py:12:    # TODO: handle a:b").expect("hit");
        assert_eq!(hit.file, "src/a.py");
        assert_eq!(hit.line, 12);
        assert_eq!(hit.content, "# TODO: handle a:b");
    }
}
