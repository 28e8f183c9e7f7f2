//! Context budget predictor.
//!
//! Budget is an externally reported usage percentage in `0..=100`. Estimates
//! are computed with integer per-mille multipliers so results are exact and
//! reproducible across platforms.

use serde::{Deserialize, Serialize};

use crate::core::types::{Complexity, TaskShape};

/// Fallback estimate for unknown task-type tags.
pub const DEFAULT_ESTIMATE: u32 = 15;

/// Base budget consumption (percent) by task-type tag.
pub const TASK_ESTIMATES: &[(&str, u32)] = &[
    // session bookkeeping
    ("audit_quick", 5),
    ("commit", 3),
    ("clear_restart", 2),
    // urgent
    ("debug", 25),
    ("debug_simple", 15),
    ("check_fix", 10),
    ("check_security", 15),
    ("check_e2e", 12),
    // pending work
    ("issue_fix_small", 15),
    ("issue_fix_medium", 25),
    ("issue_fix_large", 40),
    ("pr_auto", 20),
    ("pr_review", 15),
    // development support
    ("tdd", 30),
    ("tdd_simple", 18),
    ("research_code", 10),
    ("research_web", 8),
    ("research_plan", 12),
    ("research_review", 10),
    // autonomous improvement
    ("prd_analysis", 15),
    ("solution_search", 12),
    ("solution_migration", 35),
    ("docs_update", 8),
    // validation
    ("e2e_validation", 10),
    ("tdd_validation", 8),
    // fan-out work
    ("parallel_dev", 35),
    ("parallel_test", 20),
    ("parallel_review", 18),
    ("parallel_research", 15),
    ("default", DEFAULT_ESTIMATE),
];

const PER_MILLE: u64 = 1000;

/// Look up the base estimate for a task-type tag.
pub fn base_estimate(task_type: &str) -> u32 {
    TASK_ESTIMATES
        .iter()
        .find(|(tag, _)| *tag == task_type)
        .map(|(_, estimate)| *estimate)
        .unwrap_or(DEFAULT_ESTIMATE)
}

/// File-count multiplier in per-mille (thresholds at 3, 5 and 10 files).
pub fn file_multiplier(affected_files: u32) -> u32 {
    match affected_files {
        n if n >= 10 => 1500,
        n if n >= 5 => 1200,
        n if n >= 3 => 1100,
        _ => 1000,
    }
}

/// Complexity multiplier in per-mille.
pub fn complexity_multiplier(complexity: Complexity) -> u32 {
    match complexity {
        Complexity::Low => 800,
        Complexity::Medium => 1000,
        Complexity::High => 1300,
        Complexity::Critical => 1500,
    }
}

/// Derived budget estimate for one task. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEstimate {
    pub task_type: String,
    pub base_estimate: u32,
    /// Per-mille (1000 = 1.0x).
    pub file_multiplier: u32,
    /// Per-mille (1000 = 1.0x).
    pub complexity_multiplier: u32,
    pub adjusted_estimate: u32,
    pub affected_files: u32,
    pub complexity: Complexity,
    pub remaining: u32,
    pub can_proceed: bool,
    pub recommendation: String,
}

/// Usage band of a budget reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetLevel {
    Safe,
    Monitor,
    Prepare,
    Warning,
    Critical,
}

impl BudgetLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            BudgetLevel::Safe => "safe",
            BudgetLevel::Monitor => "monitor",
            BudgetLevel::Prepare => "prepare",
            BudgetLevel::Warning => "warning",
            BudgetLevel::Critical => "critical",
        }
    }
}

/// Thresholds that split usage into levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetThresholds {
    pub monitor: u8,
    pub prepare: u8,
    pub warning: u8,
    pub critical: u8,
}

impl Default for BudgetThresholds {
    fn default() -> Self {
        Self {
            monitor: 60,
            prepare: 80,
            warning: 85,
            critical: 90,
        }
    }
}

impl BudgetThresholds {
    pub fn level(&self, usage: u8) -> BudgetLevel {
        if usage >= self.critical {
            BudgetLevel::Critical
        } else if usage >= self.warning {
            BudgetLevel::Warning
        } else if usage >= self.prepare {
            BudgetLevel::Prepare
        } else if usage >= self.monitor {
            BudgetLevel::Monitor
        } else {
            BudgetLevel::Safe
        }
    }
}

/// Estimate the budget a task will consume given the current usage.
pub fn estimate(current_usage: u8, shape: &TaskShape) -> TaskEstimate {
    let base = base_estimate(&shape.task_type);
    let file_mult = file_multiplier(shape.affected_files);
    let complexity_mult = complexity_multiplier(shape.complexity);
    let product = u64::from(base) * u64::from(file_mult) * u64::from(complexity_mult);
    let adjusted = product / (PER_MILLE * PER_MILLE);
    let adjusted = u32::try_from(adjusted).unwrap_or(u32::MAX);

    let current = u32::from(current_usage.min(100));
    let remaining = 100 - current;
    let can_proceed = adjusted <= remaining;

    TaskEstimate {
        task_type: shape.task_type.clone(),
        base_estimate: base,
        file_multiplier: file_mult,
        complexity_multiplier: complexity_mult,
        adjusted_estimate: adjusted,
        affected_files: shape.affected_files,
        complexity: shape.complexity,
        remaining,
        can_proceed,
        recommendation: recommendation(current, adjusted, remaining, can_proceed),
    }
}

/// Decide whether the loop should clean up before running the task.
///
/// True when the task does not fit into the remaining budget, or when the task
/// alone exceeds the comfort margin. The two limits are independent.
pub fn should_cleanup(
    current_usage: u8,
    shape: &TaskShape,
    comfort_margin: u32,
) -> (bool, TaskEstimate) {
    let estimate = estimate(current_usage, shape);
    let cleanup = estimate.adjusted_estimate > estimate.remaining
        || estimate.adjusted_estimate > comfort_margin;
    (cleanup, estimate)
}

/// Estimate tasks in order with a running usage total, stopping after the
/// first task that does not fit.
pub fn analyze_tasks(current_usage: u8, shapes: &[TaskShape]) -> Vec<TaskEstimate> {
    let mut estimates = Vec::new();
    let mut cumulative = u32::from(current_usage.min(100));
    for shape in shapes {
        let usage = u8::try_from(cumulative.min(100)).unwrap_or(100);
        let estimate = estimate(usage, shape);
        let fits = estimate.can_proceed;
        if fits {
            cumulative += estimate.adjusted_estimate;
        }
        estimates.push(estimate);
        if !fits {
            break;
        }
    }
    estimates
}

/// Greedy, order-preserving admission: accept tasks while they fit.
///
/// Returns `(accepted, deferred)`; `deferred` starts at the first task that
/// did not fit and keeps the original order.
pub fn get_optimal_batch<T: Clone>(
    current_usage: u8,
    tasks: &[T],
    shape_of: impl Fn(&T) -> TaskShape,
) -> (Vec<T>, Vec<T>) {
    let shapes: Vec<TaskShape> = tasks.iter().map(&shape_of).collect();
    let estimates = analyze_tasks(current_usage, &shapes);
    let accepted = estimates.iter().take_while(|e| e.can_proceed).count();
    (tasks[..accepted].to_vec(), tasks[accepted..].to_vec())
}

fn recommendation(current: u32, estimated: u32, remaining: u32, can_proceed: bool) -> String {
    if !can_proceed {
        return format!("cleanup required (estimated {estimated}% > remaining {remaining}%)");
    }
    let projected = current + estimated;
    if projected >= 80 {
        format!("proceed (projected {projected}%, close to the 80% threshold)")
    } else if projected >= 60 {
        format!("proceed (projected {projected}%, monitor usage)")
    } else {
        format!("proceed (projected {projected}%, comfortable)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(task_type: &str, files: u32, complexity: Complexity) -> TaskShape {
        TaskShape::new(task_type, files, complexity)
    }

    #[test]
    fn large_task_near_ceiling_requires_cleanup() {
        // 25 x 1.2 x 1.3 = 39 against 18 remaining.
        let (cleanup, est) =
            should_cleanup(82, &shape("issue_fix_medium", 6, Complexity::High), 100);
        assert_eq!(est.base_estimate, 25);
        assert_eq!(est.file_multiplier, 1200);
        assert_eq!(est.complexity_multiplier, 1300);
        assert_eq!(est.adjusted_estimate, 39);
        assert_eq!(est.remaining, 18);
        assert!(!est.can_proceed);
        assert!(cleanup);
    }

    #[test]
    fn cleanup_when_over_remaining_regardless_of_margin() {
        for margin in [0, 20, 50, 100, u32::MAX] {
            let (cleanup, est) = should_cleanup(95, &shape("tdd", 1, Complexity::Medium), margin);
            assert!(est.adjusted_estimate > est.remaining);
            assert!(cleanup, "margin {margin}");
        }
    }

    #[test]
    fn cleanup_when_task_exceeds_margin_even_with_room() {
        let (cleanup, est) = should_cleanup(10, &shape("tdd", 1, Complexity::Medium), 20);
        assert!(est.can_proceed);
        assert_eq!(est.adjusted_estimate, 30);
        assert!(cleanup);
    }

    #[test]
    fn small_task_with_room_continues() {
        let (cleanup, est) = should_cleanup(80, &shape("commit", 1, Complexity::Low), 20);
        assert_eq!(est.adjusted_estimate, 2);
        assert!(!cleanup);
    }

    #[test]
    fn estimate_is_monotonic_in_file_count() {
        for complexity in [
            Complexity::Low,
            Complexity::Medium,
            Complexity::High,
            Complexity::Critical,
        ] {
            let mut last = 0;
            for files in [0, 1, 2, 3, 4, 5, 6, 9, 10, 11, 50] {
                let est = estimate(0, &shape("tdd", files, complexity));
                assert!(est.adjusted_estimate >= last);
                last = est.adjusted_estimate;
            }
        }
    }

    #[test]
    fn file_multiplier_steps_at_thresholds() {
        assert_eq!(file_multiplier(2), 1000);
        assert_eq!(file_multiplier(3), 1100);
        assert_eq!(file_multiplier(5), 1200);
        assert_eq!(file_multiplier(10), 1500);
    }

    #[test]
    fn unknown_task_type_uses_default() {
        assert_eq!(base_estimate("nope"), DEFAULT_ESTIMATE);
        assert_eq!(base_estimate("debug"), 25);
    }

    #[test]
    fn optimal_batch_is_greedy_prefix() {
        let tasks = vec![
            shape("commit", 1, Complexity::Medium), // 3 -> 53
            shape("tdd", 1, Complexity::Medium),    // 30 -> 83
            shape("debug", 1, Complexity::Medium),  // 25 > 17 remaining
            shape("commit", 1, Complexity::Medium), // deferred with the rest
        ];
        let (accepted, deferred) = get_optimal_batch(50, &tasks, Clone::clone);
        assert_eq!(accepted.len(), 2);
        assert_eq!(deferred.len(), 2);
        assert_eq!(deferred[0].task_type, "debug");
        assert_eq!(deferred[1].task_type, "commit");
    }

    #[test]
    fn levels_follow_thresholds() {
        let t = BudgetThresholds::default();
        assert_eq!(t.level(10), BudgetLevel::Safe);
        assert_eq!(t.level(60), BudgetLevel::Monitor);
        assert_eq!(t.level(80), BudgetLevel::Prepare);
        assert_eq!(t.level(86), BudgetLevel::Warning);
        assert_eq!(t.level(90), BudgetLevel::Critical);
    }
}
