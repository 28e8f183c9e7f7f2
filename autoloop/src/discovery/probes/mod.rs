//! Built-in probe catalogue, one module per tier.

pub mod development;
pub mod improvement;
pub mod pending;
pub mod session;
pub mod speculative;
pub mod urgent;

use super::Probe;

/// Every built-in probe. The engine orders them by priority.
pub fn standard_probes() -> Vec<Box<dyn Probe>> {
    vec![
        Box::new(session::FreshSession),
        Box::new(urgent::MergeConflicts),
        Box::new(urgent::BuildBroken),
        Box::new(urgent::TestFailures),
        Box::new(urgent::SecurityAudit),
        Box::new(pending::UncommittedChanges),
        Box::new(pending::OpenReviewRequests),
        Box::new(pending::OpenIssues),
        Box::new(development::PlanningDocument),
        Box::new(development::PlannedTodos),
        Box::new(improvement::LintDebt),
        Box::new(improvement::CoverageGap),
        Box::new(improvement::MissingDocs),
        Box::new(improvement::TodoComments),
        Box::new(improvement::OutdatedDependencies),
        Box::new(speculative::Retrospective),
        Box::new(speculative::AlternativeSolution),
    ]
}
