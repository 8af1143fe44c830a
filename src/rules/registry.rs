//! Shared rule state.
//!
//! Three maps keyed by rule id, each behind its own lock:
//!
//! - `membership`: ids the platform has assigned to this device, reported back
//!   in rule-config requests
//! - `definitions`: full rule bodies used for evaluation
//! - `timers`: the running [`TimerJob`] of every rule with a timer condition
//!
//! Writers take the `update` mutex first, so at most one mutation is in flight,
//! then lock maps in the order membership, definitions, timers. Readers lock a
//! single map and release it before doing any work. A rule's timer job is
//! cancelled before any of its entries are dropped.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::model::{RuleDefinition, RuleLogic};
use super::timer::TimerJob;
use crate::error::RuleError;
use crate::protocol::handlers::RuleActionHandler;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    Replaced,
    /// A definition with the same or a newer version is already held
    Stale,
}

#[derive(Default)]
pub struct RuleRegistry {
    update: Mutex<()>,
    membership: RwLock<BTreeSet<String>>,
    definitions: RwLock<HashMap<String, Arc<RuleDefinition>>>,
    timers: Mutex<HashMap<String, TimerJob>>,
}

/// Timer rules may only combine several conditions with OR.
pub fn check_timer_logic(rule: &RuleDefinition) -> Result<(), RuleError> {
    if rule.has_timer() && rule.conditions.len() > 1 && rule.logic == RuleLogic::And {
        return Err(RuleError::UnsupportedTimerLogic(rule.rule_id.clone()));
    }
    Ok(())
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds ids to the membership set; returns the ids that were new.
    pub async fn admit<I>(&self, ids: I) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        let _guard = self.update.lock().await;
        let mut membership = self.membership.write().await;
        ids.into_iter()
            .filter(|id| membership.insert(id.clone()))
            .collect()
    }

    /// Drops every trace of `rule_id`, stopping its timer first.
    ///
    /// Returns whether the rule was known at all.
    pub async fn remove(&self, rule_id: &str) -> bool {
        let _guard = self.update.lock().await;
        let mut membership = self.membership.write().await;
        let mut definitions = self.definitions.write().await;
        let mut timers = self.timers.lock().await;

        let had_timer = match timers.remove(rule_id) {
            Some(job) => {
                job.cancel();
                true
            }
            None => false,
        };
        let had_definition = definitions.remove(rule_id).is_some();
        let was_member = membership.remove(rule_id);

        let known = had_timer || had_definition || was_member;
        if known {
            info!("Removed rule {rule_id}");
        }
        known
    }

    /// Installs or replaces a definition when its version is newer.
    ///
    /// The rule joins the membership set. Any existing timer job is cancelled
    /// before its replacement is scheduled.
    pub async fn install(
        &self,
        rule: RuleDefinition,
        handler: Arc<dyn RuleActionHandler>,
    ) -> InstallOutcome {
        let _guard = self.update.lock().await;
        let mut membership = self.membership.write().await;
        let mut definitions = self.definitions.write().await;
        let mut timers = self.timers.lock().await;

        let outcome = match definitions.get(&rule.rule_id) {
            Some(held) if held.version >= rule.version => {
                debug!(
                    "Rule {} version {} not newer than {}, ignoring",
                    rule.rule_id, rule.version, held.version
                );
                return InstallOutcome::Stale;
            }
            Some(_) => InstallOutcome::Replaced,
            None => InstallOutcome::Installed,
        };

        if let Some(job) = timers.remove(&rule.rule_id) {
            job.cancel();
        }
        if rule.has_timer() {
            match check_timer_logic(&rule) {
                Ok(()) => {
                    let job = TimerJob::schedule(&rule, handler);
                    timers.insert(rule.rule_id.clone(), job);
                }
                Err(e) => warn!("Not scheduling timers: {e}"),
            }
        }

        info!("{outcome:?} rule {} at version {}", rule.rule_id, rule.version);
        membership.insert(rule.rule_id.clone());
        definitions.insert(rule.rule_id.clone(), Arc::new(rule));
        outcome
    }

    pub async fn membership(&self) -> Vec<String> {
        self.membership.read().await.iter().cloned().collect()
    }

    pub async fn is_member(&self, rule_id: &str) -> bool {
        self.membership.read().await.contains(rule_id)
    }

    /// Current definitions, cloned out so evaluation holds no lock.
    pub async fn snapshot(&self) -> Vec<Arc<RuleDefinition>> {
        self.definitions.read().await.values().cloned().collect()
    }

    pub async fn version(&self, rule_id: &str) -> Option<i64> {
        self.definitions.read().await.get(rule_id).map(|rule| rule.version)
    }

    pub async fn has_timer(&self, rule_id: &str) -> bool {
        self.timers.lock().await.contains_key(rule_id)
    }

    /// Stops every timer and forgets all rules.
    pub async fn clear(&self) {
        let _guard = self.update.lock().await;
        let mut membership = self.membership.write().await;
        let mut definitions = self.definitions.write().await;
        let mut timers = self.timers.lock().await;

        for (_, job) in timers.drain() {
            job.cancel();
        }
        definitions.clear();
        membership.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{
        Condition, DailyTimerCondition, DeviceDataCondition, RuleAction, TimeRange,
    };

    struct Noop;

    impl RuleActionHandler for Noop {
        fn on_rule_actions(&self, _actions: &[RuleAction]) {}
    }

    fn handler() -> Arc<dyn RuleActionHandler> {
        Arc::new(Noop)
    }

    fn daily() -> Condition {
        Condition::DailyTimer(DailyTimerCondition {
            time: "07:30".into(),
            days_of_week: "2".into(),
        })
    }

    fn rule(id: &str, version: i64, logic: RuleLogic, conditions: Vec<Condition>) -> RuleDefinition {
        RuleDefinition {
            rule_id: id.into(),
            rule_name: String::new(),
            logic,
            time_range: TimeRange::default(),
            status: "active".into(),
            conditions,
            actions: Vec::new(),
            version,
        }
    }

    #[tokio::test]
    async fn test_version_gate() {
        let registry = RuleRegistry::new();
        let first = rule("a", 2, RuleLogic::Or, Vec::new());
        assert_eq!(registry.install(first.clone(), handler()).await, InstallOutcome::Installed);
        assert_eq!(registry.install(first, handler()).await, InstallOutcome::Stale);
        assert_eq!(
            registry.install(rule("a", 1, RuleLogic::Or, Vec::new()), handler()).await,
            InstallOutcome::Stale
        );
        assert_eq!(
            registry.install(rule("a", 3, RuleLogic::Or, Vec::new()), handler()).await,
            InstallOutcome::Replaced
        );
        assert_eq!(registry.version("a").await, Some(3));
        assert_eq!(registry.membership().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_timer_tracks_definition() {
        let registry = RuleRegistry::new();
        registry.install(rule("t", 1, RuleLogic::Or, vec![daily()]), handler()).await;
        assert!(registry.has_timer("t").await);

        // replacement without timer conditions tears the job down
        registry.install(rule("t", 2, RuleLogic::Or, Vec::new()), handler()).await;
        assert!(!registry.has_timer("t").await);

        registry.install(rule("t", 3, RuleLogic::Or, vec![daily(), daily()]), handler()).await;
        assert!(registry.has_timer("t").await);
        assert!(registry.remove("t").await);
        assert!(!registry.has_timer("t").await);
        assert!(!registry.is_member("t").await);
        assert!(registry.snapshot().await.is_empty());
        assert!(!registry.remove("t").await);
    }

    #[tokio::test]
    async fn test_and_timer_rule_gets_no_job() {
        let registry = RuleRegistry::new();
        let conditions = vec![
            daily(),
            Condition::DeviceData(DeviceDataCondition::default()),
        ];
        registry.install(rule("x", 1, RuleLogic::And, conditions), handler()).await;
        assert!(!registry.has_timer("x").await);
        assert_eq!(registry.version("x").await, Some(1));
    }

    #[tokio::test]
    async fn test_admit_reports_new_ids() {
        let registry = RuleRegistry::new();
        assert_eq!(registry.admit(["a".to_string(), "b".to_string()]).await.len(), 2);
        assert_eq!(registry.admit(["b".to_string()]).await.len(), 0);
        registry.clear().await;
        assert!(registry.membership().await.is_empty());
    }
}
