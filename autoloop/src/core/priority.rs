//! Priority ladder for discovered work.
//!
//! Order is encoded in the enum declaration: every check in a lower tier
//! outranks every check in a higher tier, and `rank` orders checks inside a
//! tier. Numeric values carry no magnitude beyond ordering.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Priority band. Declaration order is significance order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Session bookkeeping (first iteration housekeeping).
    Session,
    /// Broken build or tests, merge conflicts, security findings.
    Urgent,
    /// Uncommitted changes, open review requests, open issues.
    Pending,
    /// Guided test-first implementation and research.
    Development,
    /// Lint debt, coverage gaps, stale TODOs, dependency drift.
    Improvement,
    /// Retrospective analysis and alternative-solution search.
    Speculative,
}

impl Tier {
    pub const ALL: [Tier; 6] = [
        Tier::Session,
        Tier::Urgent,
        Tier::Pending,
        Tier::Development,
        Tier::Improvement,
        Tier::Speculative,
    ];

    pub fn index(self) -> u8 {
        match self {
            Tier::Session => 0,
            Tier::Urgent => 1,
            Tier::Pending => 2,
            Tier::Development => 3,
            Tier::Improvement => 4,
            Tier::Speculative => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Session => "session",
            Tier::Urgent => "urgent",
            Tier::Pending => "pending",
            Tier::Development => "development",
            Tier::Improvement => "improvement",
            Tier::Speculative => "speculative",
        }
    }
}

/// Position of a check on the ladder: `(tier, rank-within-tier)`.
///
/// Ordering is lexicographic, so a rank never lifts a check above a lower tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority {
    pub tier: Tier,
    pub rank: u8,
}

impl Priority {
    pub const fn new(tier: Tier, rank: u8) -> Self {
        Self { tier, rank }
    }

    /// Short label such as `T1.2`.
    pub fn label(&self) -> String {
        format!("T{}.{}", self.tier.index(), self.rank)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label(), self.tier.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_outranks_rank() {
        let urgent_late = Priority::new(Tier::Urgent, 9);
        let pending_first = Priority::new(Tier::Pending, 0);
        assert!(urgent_late < pending_first);
    }

    #[test]
    fn tiers_are_declared_in_ascending_order() {
        let mut sorted = Tier::ALL;
        sorted.sort();
        assert_eq!(sorted, Tier::ALL);
        let indexes: Vec<u8> = Tier::ALL.iter().map(|t| t.index()).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn label_uses_tier_index() {
        assert_eq!(Priority::new(Tier::Improvement, 2).label(), "T4.2");
    }
}
