//! Tier 0: session bookkeeping.

use anyhow::Result;

use crate::core::priority::{Priority, Tier};
use crate::core::types::{Complexity, DiscoveredTask};
use crate::discovery::{Environment, Probe, new_task};

/// One-shot housekeeping on the first iteration of a fresh session.
pub struct FreshSession;

impl Probe for FreshSession {
    fn id(&self) -> &'static str {
        "fresh-session"
    }

    fn priority(&self) -> Priority {
        Priority::new(Tier::Session, 0)
    }

    fn task_type(&self) -> &'static str {
        "audit_quick"
    }

    fn check(&self, env: &Environment<'_>) -> Result<Option<DiscoveredTask>> {
        if !env.session.fresh {
            return Ok(None);
        }
        let mut task = new_task(self, "session", "Session start audit", "/audit quick");
        task.description = "Review repository state before autonomous work begins".to_string();
        task.complexity = Complexity::Low;
        Ok(Some(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::SessionView;
    use crate::test_support::ProbeFixture;

    #[test]
    fn fires_only_for_fresh_sessions() {
        let fixture = ProbeFixture::new();
        assert!(fixture.check(&FreshSession).expect("check").is_none());

        let fresh = fixture.with_session(SessionView {
            fresh: true,
            iteration: 1,
            ..SessionView::default()
        });
        let task = fresh.check(&FreshSession).expect("check").expect("task");
        assert_eq!(task.task_type, "audit_quick");
        assert_eq!(task.priority.label(), "T0.0");
    }
}
