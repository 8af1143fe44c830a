//! Local rule engine.
//!
//! Rule membership arrives as a `$device_rule` property push carrying only ids
//! and versions. The engine then asks the platform for the full definitions
//! with a `device_rule_config_request` event and installs what comes back in
//! the `device_rule_config_response`. Reported properties are evaluated
//! against the installed rules as they are sent.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::model::{
    RuleAction, RuleConfigRequest, RuleDefinition, RuleLogic, RuleVersion, REMOVED_VERSION,
    RULE_CONFIG_REQUEST, RULE_SERVICE_ID,
};
use super::registry::{InstallOutcome, RuleRegistry};
use crate::mqtt::topics::{device_topic, EVENTS_UP};
use crate::mqtt::{publish_json, Publisher};
use crate::protocol::handlers::{CommandHandler, RuleActionHandler};
use crate::protocol::model::{Command, EventEnvelope, ServiceEvent, ServiceProperty};

/// Applies rule actions addressed to this device as commands.
pub struct CommandActionHandler {
    device_id: String,
    commands: Option<Arc<dyn CommandHandler>>,
}

impl CommandActionHandler {
    pub fn new(device_id: impl Into<String>, commands: Option<Arc<dyn CommandHandler>>) -> Self {
        Self {
            device_id: device_id.into(),
            commands,
        }
    }
}

impl RuleActionHandler for CommandActionHandler {
    fn on_rule_actions(&self, actions: &[RuleAction]) {
        for action in actions {
            if !action.device_id.eq_ignore_ascii_case(&self.device_id) {
                warn!(
                    "Rule action targets {} but this device is {}",
                    action.device_id, self.device_id
                );
                continue;
            }
            let Some(commands) = &self.commands else {
                warn!("Rule action dropped: no command handler registered");
                continue;
            };
            let command = Command {
                object_device_id: None,
                service_id: action.command.service_id.clone(),
                command_name: action.command.command_name.clone(),
                paras: action.command.command_body.clone(),
            };
            if !commands.on_command(&command).success {
                warn!("Rule command {} failed", command.command_name);
            }
        }
    }
}

pub struct RuleEngine {
    registry: RuleRegistry,
    publisher: Arc<dyn Publisher>,
    actions: Arc<dyn RuleActionHandler>,
}

impl RuleEngine {
    pub fn new(publisher: Arc<dyn Publisher>, actions: Arc<dyn RuleActionHandler>) -> Self {
        Self {
            registry: RuleRegistry::new(),
            publisher,
            actions,
        }
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Applies a `$device_rule` property push of `{rule_id: {version}}`.
    ///
    /// Ids with a version of -1 are removed along with their timers; all
    /// others join the membership set. A rule-config request listing the
    /// full membership and the removed ids is published afterwards.
    pub async fn modify_rules(&self, properties: &Map<String, Value>) -> bool {
        let mut admitted = Vec::new();
        let mut removed = Vec::new();

        for (rule_id, value) in properties {
            let version: RuleVersion = match serde_json::from_value(value.clone()) {
                Ok(version) => version,
                Err(e) => {
                    warn!("Ignoring malformed rule entry {rule_id}: {e}");
                    continue;
                }
            };
            if version.version == REMOVED_VERSION {
                self.registry.remove(rule_id).await;
                removed.push(rule_id.clone());
            } else {
                admitted.push(rule_id.clone());
            }
        }
        let new_ids = self.registry.admit(admitted).await;
        if !new_ids.is_empty() {
            info!("Rule membership gained {new_ids:?}");
        }

        self.request_config(removed).await
    }

    /// Installs the definitions of a `device_rule_config_response`.
    pub async fn apply_config_response(&self, rules: Vec<RuleDefinition>) {
        if rules.is_empty() {
            warn!("Rule config response carried no rules");
            return;
        }
        let before = self.registry.membership().await;
        let mut removed = Vec::new();

        for rule in rules {
            if rule.is_inactive() {
                if self.registry.remove(&rule.rule_id).await {
                    removed.push(rule.rule_id);
                }
                continue;
            }
            let rule_id = rule.rule_id.clone();
            if self.registry.install(rule, Arc::clone(&self.actions)).await == InstallOutcome::Stale {
                debug!("Rule {rule_id} unchanged");
            }
        }

        if self.registry.membership().await != before {
            self.request_config(removed).await;
        }
    }

    /// Evaluates every installed rule against a property report.
    ///
    /// Returns how many times actions fired.
    pub async fn evaluate_report(&self, services: &[ServiceProperty]) -> usize {
        let now = Utc::now();
        let mut fired = 0;

        for rule in self.registry.snapshot().await {
            if !rule.time_range.applies_at(now) {
                debug!("Rule {} outside its time range", rule.rule_id);
                continue;
            }
            match rule.logic {
                RuleLogic::Or => {
                    for condition in &rule.conditions {
                        if condition.is_satisfied(services) {
                            self.fire(&rule);
                            fired += 1;
                        }
                    }
                }
                RuleLogic::And => {
                    if !rule.conditions.is_empty()
                        && rule.conditions.iter().all(|c| c.is_satisfied(services))
                    {
                        self.fire(&rule);
                        fired += 1;
                    }
                }
                RuleLogic::Unsupported => {
                    warn!("Rule {} has unsupported logic", rule.rule_id);
                }
            }
        }
        fired
    }

    fn fire(&self, rule: &RuleDefinition) {
        info!("Rule {} fired", rule.rule_id);
        self.actions.on_rule_actions(&rule.actions);
    }

    async fn request_config(&self, del_ids: Vec<String>) -> bool {
        let request = RuleConfigRequest {
            rule_ids: self.registry.membership().await,
            del_ids,
        };
        let envelope = EventEnvelope::single(
            None,
            ServiceEvent::new(RULE_SERVICE_ID, RULE_CONFIG_REQUEST, &request),
        );
        let topic = device_topic(self.publisher.device_id(), EVENTS_UP);
        let sent = publish_json(self.publisher.as_ref(), &topic, &envelope).await;
        info!(
            "Rule config request for {} rule(s), {} removed: sent={sent}",
            request.rule_ids.len(),
            request.del_ids.len()
        );
        sent
    }

    /// Stops all timers; called when the device shuts down.
    pub async fn shutdown(&self) {
        self.registry.clear().await;
    }
}
