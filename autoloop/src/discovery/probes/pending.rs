//! Tier 2: work already in flight.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::priority::{Priority, Tier};
use crate::core::types::{Complexity, DiscoveredTask};
use crate::discovery::{Environment, Probe, new_task};

/// Uncommitted changes past a line-count threshold.
pub struct UncommittedChanges;

impl Probe for UncommittedChanges {
    fn id(&self) -> &'static str {
        "uncommitted-changes"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Pending, 0)
    }

    fn task_type(&self) -> &'static str {
        "commit"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        let git = env.git();
        let entries = git.status_porcelain()?;
        let modified = entries.iter().filter(|e| e.is_tracked_change()).count();
        let untracked = entries.iter().filter(|e| e.is_untracked()).count();
        if modified == 0 {
            return Ok(None);
        }
        // An unborn branch has no HEAD to diff against; count files only.
        let changed_lines = git.diff_numstat_head().map(|s| s.changed_lines()).ok();
        if let Some(lines) = changed_lines
            && lines < env.config.uncommitted_line_threshold
        {
            return Ok(None);
        }
        let mut task = new_task(self, "commit", "Commit pending changes", "/commit");
        task.description = format!("{modified} modified files, {untracked} new files");
        if let Some(lines) = changed_lines {
            task.description.push_str(&format!(", {lines} changed lines"));
        }
        task.affected_files = modified as u32;
        task.complexity = Complexity::Low;
        task.details = Some(json!({
            "modified": modified,
            "untracked": untracked,
            "changed_lines": changed_lines,
        }));
        Ok(Some(task))
    }
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    number: u64,
    title: String,
    #[serde(default, rename = "reviewDecision")]
    review_decision: Option<String>,
    #[serde(default, rename = "isDraft")]
    is_draft: bool,
}

/// Open pull requests waiting for review.
pub struct OpenReviewRequests;

impl Probe for OpenReviewRequests {
    fn id(&self) -> &'static str {
        "open-review-requests"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Pending, 1)
    }

    fn task_type(&self) -> &'static str {
        "pr_review"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        let argv = tracker_args(
            env,
            &["pr", "list", "--state", "open", "--json", "number,title,reviewDecision,isDraft"],
        );
        let result = env.run(&argv)?;
        if !result.success() || result.stdout.trim().is_empty() {
            return Ok(None);
        }
        let prs: Vec<PullRequest> =
            serde_json::from_str(&result.stdout).context("parse pull request list")?;
        let open: Vec<&PullRequest> = prs.iter().filter(|pr| !pr.is_draft).collect();
        let target = open
            .iter()
            .find(|pr| pr.review_decision.as_deref() == Some("REVIEW_REQUIRED"))
            .or_else(|| open.first());
        let Some(target) = target else {
            return Ok(None);
        };
        let mut task = new_task(
            self,
            "review",
            format!("#{}: {}", target.number, target.title),
            format!("/pr review #{}", target.number),
        );
        task.description = format!("{} open pull requests", open.len());
        task.details = Some(json!({ "number": target.number, "open": open.len() }));
        Ok(Some(task))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct Issue {
    number: u64,
    title: String,
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct Label {
    name: String,
}

impl Issue {
    fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.name.eq_ignore_ascii_case(name))
    }

    /// Size from labels: `size:large`/`large`/`epic`, `size:small`/`small`/`good first issue`.
    fn size(&self) -> (&'static str, Complexity) {
        if ["size:large", "large", "epic"].iter().any(|l| self.has_label(l)) {
            ("issue_fix_large", Complexity::High)
        } else if ["size:small", "small", "good first issue"]
            .iter()
            .any(|l| self.has_label(l))
        {
            ("issue_fix_small", Complexity::Low)
        } else {
            ("issue_fix_medium", Complexity::Medium)
        }
    }
}

/// Open issues in the tracker, bugs first.
pub struct OpenIssues;

impl Probe for OpenIssues {
    fn id(&self) -> &'static str {
        "open-issues"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Pending, 2)
    }

    fn task_type(&self) -> &'static str {
        "issue_fix_medium"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        let limit = env.config.issue_limit.to_string();
        let argv = tracker_args(
            env,
            &["issue", "list", "--state", "open", "--limit", &limit, "--json", "number,title,labels"],
        );
        let result = env.run(&argv)?;
        if !result.success() || result.stdout.trim().is_empty() {
            return Ok(None);
        }
        let issues: Vec<Issue> =
            serde_json::from_str(&result.stdout).context("parse issue list")?;
        let target = issues
            .iter()
            .find(|issue| issue.has_label("bug"))
            .or_else(|| issues.first());
        let Some(target) = target else {
            return Ok(None);
        };
        let (task_type, complexity) = target.size();
        let mut task = new_task(
            self,
            "issue",
            format!("#{}: {}", target.number, target.title),
            format!("/issue fix #{}", target.number),
        );
        task.description = format!("Highest priority of {} open issues", issues.len());
        task.task_type = task_type.to_string();
        task.complexity = complexity;
        task.details = Some(json!({ "issue": target }));
        Ok(Some(task))
    }
}

fn tracker_args(env: &Environment<'_>, args: &[&str]) -> Vec<String> {
    std::iter::once(env.config.tracker_program.clone())
        .chain(args.iter().map(|a| a.to_string()))
        .collect()
}
