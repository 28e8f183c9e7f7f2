//! The discovery cascade.

use tracing::{debug, info, instrument, warn};

use super::{Environment, Probe};
use crate::core::priority::Priority;
use crate::core::types::DiscoveredTask;

/// Result of evaluating one probe for `discover --report`.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Match(Box<DiscoveredTask>),
    NoMatch,
    /// Tool missing or failed; counts as no match in the cascade.
    Error(String),
    Disabled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub id: &'static str,
    pub priority: Priority,
    pub outcome: ProbeOutcome,
}

/// Ordered list of probes evaluated tier by tier.
pub struct DiscoveryEngine {
    probes: Vec<Box<dyn Probe>>,
}

impl DiscoveryEngine {
    /// Probes are ordered by priority regardless of the order given.
    /// Ties keep their relative input order.
    pub fn new(mut probes: Vec<Box<dyn Probe>>) -> Self {
        probes.sort_by_key(|probe| probe.priority());
        Self { probes }
    }

    /// Engine with the full built-in probe catalogue.
    pub fn standard() -> Self {
        Self::new(super::probes::standard_probes())
    }

    pub fn probe_ids(&self) -> Vec<&'static str> {
        self.probes.iter().map(|probe| probe.id()).collect()
    }

    /// Highest-priority actionable task, or `None` when nothing matches.
    ///
    /// Stops at the first match. Probe errors are logged and skipped.
    #[instrument(skip_all)]
    pub fn discover_next_task(&self, env: &Environment<'_>) -> Option<DiscoveredTask> {
        let task = self
            .probes
            .iter()
            .filter(|probe| env.config.is_enabled(probe.id()))
            .find_map(|probe| evaluate(probe.as_ref(), env).ok().flatten());
        match &task {
            Some(task) => info!(probe = %task.probe, priority = %task.priority.label(), title = %task.title, "task discovered"),
            None => debug!("no probe matched"),
        }
        task
    }

    /// Evaluate every probe without short-circuiting.
    pub fn report(&self, env: &Environment<'_>) -> Vec<ProbeReport> {
        self.probes
            .iter()
            .map(|probe| {
                let outcome = if !env.config.is_enabled(probe.id()) {
                    ProbeOutcome::Disabled
                } else {
                    match evaluate(probe.as_ref(), env) {
                        Ok(Some(task)) => ProbeOutcome::Match(Box::new(task)),
                        Ok(None) => ProbeOutcome::NoMatch,
                        Err(reason) => ProbeOutcome::Error(reason),
                    }
                };
                ProbeReport {
                    id: probe.id(),
                    priority: probe.priority(),
                    outcome,
                }
            })
            .collect()
    }
}

fn evaluate(probe: &dyn Probe, env: &Environment<'_>) -> Result<Option<DiscoveredTask>, String> {
    match probe.check(env) {
        Ok(found) => {
            debug!(probe = probe.id(), matched = found.is_some(), "probe evaluated");
            Ok(found)
        }
        Err(err) => {
            let reason = format!("{err:#}");
            warn!(probe = probe.id(), err = %reason, "probe failed, treating as no match");
            Err(reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::priority::Tier;
    use crate::discovery::SessionView;
    use crate::io::config::DiscoveryConfig;
    use crate::test_support::{ScriptedRunner, StubProbe};

    fn engine_env<'a>(
        root: &'a std::path::Path,
        config: &'a DiscoveryConfig,
        session: &'a SessionView,
        runner: &'a ScriptedRunner,
    ) -> Environment<'a> {
        Environment {
            root,
            config,
            session,
            runner,
        }
    }

    #[test]
    fn lowest_tier_wins_even_when_registered_last() {
        let engine = DiscoveryEngine::new(vec![
            Box::new(StubProbe::matching("lint-debt", Priority::new(Tier::Improvement, 0))),
            Box::new(StubProbe::matching("uncommitted", Priority::new(Tier::Pending, 0))),
            Box::new(StubProbe::matching("build-broken", Priority::new(Tier::Urgent, 1))),
        ]);
        let config = DiscoveryConfig::default();
        let session = SessionView::detached();
        let runner = ScriptedRunner::new();
        let env = engine_env(std::path::Path::new("."), &config, &session, &runner);

        let task = engine.discover_next_task(&env).expect("task");
        assert_eq!(task.probe, "build-broken");
        assert_eq!(task.priority.tier, Tier::Urgent);
        // Repeated calls on the same snapshot are identical.
        assert_eq!(engine.discover_next_task(&env), Some(task));
    }

    #[test]
    fn failing_probe_is_no_match() {
        let engine = DiscoveryEngine::new(vec![
            Box::new(StubProbe::failing("broken-tool", Priority::new(Tier::Urgent, 0))),
            Box::new(StubProbe::quiet("quiet", Priority::new(Tier::Urgent, 1))),
            Box::new(StubProbe::matching("fallback", Priority::new(Tier::Speculative, 0))),
        ]);
        let config = DiscoveryConfig::default();
        let session = SessionView::detached();
        let runner = ScriptedRunner::new();
        let env = engine_env(std::path::Path::new("."), &config, &session, &runner);

        assert_eq!(
            engine.discover_next_task(&env).map(|t| t.probe),
            Some("fallback".to_string())
        );
    }

    #[test]
    fn nothing_to_do_is_none() {
        let engine = DiscoveryEngine::new(vec![Box::new(StubProbe::quiet(
            "quiet",
            Priority::new(Tier::Urgent, 0),
        ))]);
        let config = DiscoveryConfig::default();
        let session = SessionView::detached();
        let runner = ScriptedRunner::new();
        let env = engine_env(std::path::Path::new("."), &config, &session, &runner);
        assert!(engine.discover_next_task(&env).is_none());
    }

    #[test]
    fn report_runs_every_probe_and_respects_disabled() {
        let engine = DiscoveryEngine::new(vec![
            Box::new(StubProbe::matching("a", Priority::new(Tier::Urgent, 0))),
            Box::new(StubProbe::failing("b", Priority::new(Tier::Urgent, 1))),
            Box::new(StubProbe::matching("c", Priority::new(Tier::Pending, 0))),
        ]);
        let config = DiscoveryConfig {
            disabled_probes: vec!["a".to_string()],
            ..DiscoveryConfig::default()
        };
        let session = SessionView::detached();
        let runner = ScriptedRunner::new();
        let env = engine_env(std::path::Path::new("."), &config, &session, &runner);

        let report = engine.report(&env);
        assert_eq!(report.len(), 3);
        assert_eq!(report[0].outcome, ProbeOutcome::Disabled);
        assert!(matches!(report[1].outcome, ProbeOutcome::Error(_)));
        assert!(matches!(report[2].outcome, ProbeOutcome::Match(_)));
        assert_eq!(engine.discover_next_task(&env).map(|t| t.probe), Some("c".to_string()));
    }

    #[test]
    fn standard_catalogue_is_in_ladder_order() {
        let engine = DiscoveryEngine::standard();
        let ids = engine.probe_ids();
        assert_eq!(ids.first(), Some(&"fresh-session"));
        assert_eq!(ids.last(), Some(&"alternative-solution"));
        let priorities: Vec<Priority> = engine.probes.iter().map(|p| p.priority()).collect();
        let mut sorted = priorities.clone();
        sorted.sort();
        assert_eq!(priorities, sorted);
    }
}
