//! Wire form of platform-authored device rules.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

pub const RULE_SERVICE_ID: &str = "$device_rule";
pub const RULE_CONFIG_REQUEST: &str = "device_rule_config_request";
pub const RULE_CONFIG_RESPONSE: &str = "device_rule_config_response";
/// Version pushed in the shadow for a rule that was deleted
pub const REMOVED_VERSION: i64 = -1;

/// `null` decodes like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decodes every element on its own and drops the malformed ones.
fn decode_each<T: DeserializeOwned>(values: Vec<Value>, what: &str) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Skipping malformed {what}: {e}");
                None
            }
        })
        .collect()
}

fn skip_malformed_conditions<'de, D>(deserializer: D) -> Result<Vec<Condition>, D::Error>
where
    D: Deserializer<'de>,
{
    let values: Vec<Value> = null_as_default(deserializer)?;
    Ok(decode_each(values, "rule condition"))
}

fn skip_malformed_rules<'de, D>(deserializer: D) -> Result<Vec<RuleDefinition>, D::Error>
where
    D: Deserializer<'de>,
{
    let values: Vec<Value> = null_as_default(deserializer)?;
    Ok(decode_each(values, "rule"))
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RuleLogic {
    #[serde(rename = "and", alias = "AND", alias = "And")]
    And,
    #[serde(rename = "or", alias = "OR", alias = "Or")]
    Or,
    #[default]
    #[serde(other)]
    Unsupported,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeRange {
    #[serde(deserialize_with = "null_as_default")]
    pub start_time: String,
    #[serde(deserialize_with = "null_as_default")]
    pub end_time: String,
    #[serde(deserialize_with = "null_as_default")]
    pub days_of_week: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleDeviceInfo {
    #[serde(deserialize_with = "null_as_default")]
    pub device_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub path: String,
}

/// Compare a reported property against a literal
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceDataCondition {
    #[serde(deserialize_with = "null_as_default")]
    pub device_info: RuleDeviceInfo,
    #[serde(deserialize_with = "null_as_default")]
    pub operator: String,
    #[serde(deserialize_with = "null_as_default")]
    pub value: String,
    #[serde(deserialize_with = "null_as_default")]
    pub in_values: Vec<String>,
}

/// Fire at a time of day on the listed weekdays
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DailyTimerCondition {
    #[serde(deserialize_with = "null_as_default")]
    pub time: String,
    #[serde(deserialize_with = "null_as_default")]
    pub days_of_week: String,
}

/// Fire every `repeat_interval` seconds, `repeat_count` times, from `start_time`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SimpleTimerCondition {
    #[serde(deserialize_with = "null_as_default")]
    pub start_time: String,
    #[serde(deserialize_with = "null_as_default")]
    pub repeat_interval: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub repeat_count: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Condition {
    #[serde(rename = "DEVICE_DATA", alias = "device_data")]
    DeviceData(DeviceDataCondition),
    #[serde(rename = "DAILY_TIMER", alias = "daily_timer")]
    DailyTimer(DailyTimerCondition),
    #[serde(rename = "SIMPLE_TIMER", alias = "simple_timer")]
    SimpleTimer(SimpleTimerCondition),
    #[serde(other)]
    Unknown,
}

impl Condition {
    pub fn is_timer(&self) -> bool {
        matches!(self, Condition::DailyTimer(_) | Condition::SimpleTimer(_))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleCommand {
    #[serde(deserialize_with = "null_as_default")]
    pub service_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub command_name: String,
    pub command_body: Value,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleAction {
    #[serde(rename = "type", deserialize_with = "null_as_default")]
    pub action_type: String,
    #[serde(deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(deserialize_with = "null_as_default")]
    pub device_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub command: RuleCommand,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    pub rule_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rule_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub logic: RuleLogic,
    #[serde(default, deserialize_with = "null_as_default")]
    pub time_range: TimeRange,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    /// Conditions that fail to decode are dropped; the rest of the rule stays.
    #[serde(default, deserialize_with = "skip_malformed_conditions")]
    pub conditions: Vec<Condition>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub actions: Vec<RuleAction>,
    #[serde(
        rename = "ruleVersionInShadow",
        default,
        deserialize_with = "null_as_default"
    )]
    pub version: i64,
}

impl RuleDefinition {
    pub fn is_inactive(&self) -> bool {
        self.status.eq_ignore_ascii_case("inactive")
    }

    pub fn has_timer(&self) -> bool {
        self.conditions.iter().any(Condition::is_timer)
    }
}

/// `{rulesInfos: [...]}` carried by the rule-config response.
///
/// Each rule is decoded on its own, so one malformed rule does not discard
/// the others.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleConfigResponse {
    #[serde(deserialize_with = "skip_malformed_rules")]
    pub rules_infos: Vec<RuleDefinition>,
}

/// `{ruleIds, delIds}` sent so the platform can reconcile its shadow
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfigRequest {
    pub rule_ids: Vec<String>,
    pub del_ids: Vec<String>,
}

/// Per-rule entry in the `$device_rule` property push
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuleVersion {
    pub version: i64,
}
