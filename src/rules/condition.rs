//! Device-data condition evaluation against a property report.

use serde_json::Value;
use tracing::{debug, warn};

use super::model::{Condition, DeviceDataCondition};
use crate::protocol::model::ServiceProperty;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Equal,
    Between,
    In,
}

impl Operator {
    pub fn parse(value: &str) -> Option<Self> {
        let op = match value.trim() {
            ">" => Self::Greater,
            ">=" => Self::GreaterOrEqual,
            "<" => Self::Less,
            "<=" => Self::LessOrEqual,
            "=" => Self::Equal,
            other if other.eq_ignore_ascii_case("between") => Self::Between,
            other if other.eq_ignore_ascii_case("in") => Self::In,
            _ => return None,
        };
        Some(op)
    }
}

/// Numbers and numeric strings both compare numerically.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_literal(value: &str) -> Option<f64> {
    value.trim().parse().ok()
}

impl DeviceDataCondition {
    /// The path is `service/.../property`; only the first and last segments matter.
    fn target(&self) -> Option<(&str, &str)> {
        let path = self.device_info.path.trim();
        let service = path.split('/').next().filter(|s| !s.is_empty())?;
        let property = path.rsplit('/').next().filter(|s| !s.is_empty())?;
        Some((service, property))
    }

    pub fn is_satisfied(&self, services: &[ServiceProperty]) -> bool {
        let Some((service_id, property)) = self.target() else {
            warn!("Rule condition path is invalid: {:?}", self.device_info.path);
            return false;
        };
        let Some(operator) = Operator::parse(&self.operator) else {
            warn!("Unsupported rule operator {:?}", self.operator);
            return false;
        };

        let matched = services
            .iter()
            .filter(|service| service.service_id.eq_ignore_ascii_case(service_id))
            .filter_map(|service| service.properties.get(property))
            .any(|current| self.compare(operator, current));
        if matched {
            debug!("Condition {service_id}/{property} {} {} matched", self.operator, self.value);
        }
        matched
    }

    fn compare(&self, operator: Operator, current: &Value) -> bool {
        let number = as_number(current);
        match operator {
            Operator::Greater => self.numeric(number, |c, t| c > t),
            Operator::GreaterOrEqual => self.numeric(number, |c, t| c >= t),
            Operator::Less => self.numeric(number, |c, t| c < t),
            Operator::LessOrEqual => self.numeric(number, |c, t| c <= t),
            Operator::Equal => {
                if self.value.is_empty() {
                    return false;
                }
                match (number, parse_literal(&self.value)) {
                    (Some(c), Some(t)) => c == t,
                    _ => as_text(current).is_some_and(|c| c.eq_ignore_ascii_case(self.value.trim())),
                }
            }
            Operator::Between => {
                let bounds: Vec<_> = self.value.split(',').collect();
                let [low, high] = bounds.as_slice() else {
                    warn!("Between condition needs two values, got {:?}", self.value);
                    return false;
                };
                match (number, parse_literal(low), parse_literal(high)) {
                    (Some(c), Some(low), Some(high)) => low <= c && c <= high,
                    _ => false,
                }
            }
            Operator::In => number.is_some_and(|c| {
                self.in_values
                    .iter()
                    .filter_map(|v| parse_literal(v))
                    .any(|t| t == c)
            }),
        }
    }

    fn numeric(&self, current: Option<f64>, cmp: impl Fn(f64, f64) -> bool) -> bool {
        match (current, parse_literal(&self.value)) {
            (Some(current), Some(target)) => cmp(current, target),
            (_, None) => {
                warn!("Rule condition value is not numeric: {:?}", self.value);
                false
            }
            _ => false,
        }
    }
}

impl Condition {
    /// Timer and unknown conditions never hold for a property report.
    pub fn is_satisfied(&self, services: &[ServiceProperty]) -> bool {
        match self {
            Condition::DeviceData(data) => data.is_satisfied(services),
            Condition::DailyTimer(_) | Condition::SimpleTimer(_) | Condition::Unknown => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::RuleDeviceInfo;
    use serde_json::json;

    fn condition(path: &str, operator: &str, value: &str) -> DeviceDataCondition {
        DeviceDataCondition {
            device_info: RuleDeviceInfo {
                device_id: "dev".into(),
                path: path.into(),
            },
            operator: operator.into(),
            value: value.into(),
            in_values: Vec::new(),
        }
    }

    fn report(service_id: &str, properties: Value) -> Vec<ServiceProperty> {
        let Value::Object(properties) = properties else {
            panic!("properties must be an object");
        };
        vec![ServiceProperty {
            service_id: service_id.into(),
            properties,
            event_time: None,
        }]
    }

    #[test]
    fn test_numeric_operators() {
        let services = report("Smoke", json!({"temperature": 31.5}));
        assert!(condition("smoke/temperature", ">", "30").is_satisfied(&services));
        assert!(condition("smoke/temperature", ">=", "31.5").is_satisfied(&services));
        assert!(!condition("smoke/temperature", "<", "30").is_satisfied(&services));
        assert!(condition("smoke/temperature", "<=", "32").is_satisfied(&services));
        assert!(condition("smoke/temperature", "=", "31.5").is_satisfied(&services));
    }

    #[test]
    fn test_path_uses_first_and_last_segment() {
        let services = report("smoke", json!({"temperature": "40"}));
        assert!(condition("smoke/sensor/temperature", ">", "39").is_satisfied(&services));
        assert!(!condition("other/temperature", ">", "39").is_satisfied(&services));
        assert!(!condition("smoke/humidity", ">", "0").is_satisfied(&services));
    }

    #[test]
    fn test_equality_falls_back_to_text() {
        let services = report("door", json!({"state": "OPEN"}));
        assert!(condition("door/state", "=", "open").is_satisfied(&services));
        assert!(!condition("door/state", "=", "closed").is_satisfied(&services));
        assert!(!condition("door/state", "=", "").is_satisfied(&services));
    }

    #[test]
    fn test_between_is_inclusive() {
        let services = report("s", json!({"level": 10}));
        assert!(condition("s/level", "between", "10,20").is_satisfied(&services));
        assert!(condition("s/level", "BETWEEN", "0,10").is_satisfied(&services));
        assert!(!condition("s/level", "between", "11,20").is_satisfied(&services));
        assert!(!condition("s/level", "between", "10").is_satisfied(&services));
    }

    #[test]
    fn test_in_values() {
        let services = report("s", json!({"mode": 3}));
        let mut cond = condition("s/mode", "in", "");
        cond.in_values = vec!["1".into(), "3".into()];
        assert!(cond.is_satisfied(&services));
        cond.in_values = vec!["x".into(), "4".into()];
        assert!(!cond.is_satisfied(&services));
    }

    #[test]
    fn test_unknown_operator_and_bad_value() {
        let services = report("s", json!({"mode": 3}));
        assert!(!condition("s/mode", "~", "3").is_satisfied(&services));
        assert!(!condition("s/mode", ">", "three").is_satisfied(&services));
        assert!(!condition("", ">", "1").is_satisfied(&services));
    }
}
