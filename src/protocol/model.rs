//! JSON payload schemas exchanged with the platform.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub const EVENT_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";

pub fn event_time(now: DateTime<Utc>) -> String {
    now.format(EVENT_TIME_FORMAT).to_string()
}

/// Command pushed on `commands/request_id=…`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Command {
    pub object_device_id: Option<String>,
    pub service_id: String,
    pub command_name: String,
    pub paras: Value,
}

/// What a command handler hands back
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandOutcome {
    pub success: bool,
    pub response_name: Option<String>,
    pub paras: Value,
}

impl CommandOutcome {
    pub fn success(paras: Value) -> Self {
        Self {
            success: true,
            response_name: None,
            paras,
        }
    }

    pub fn failure(paras: Value) -> Self {
        Self {
            success: false,
            response_name: None,
            paras,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct CommandResponse {
    pub result_code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_name: Option<String>,
    pub paras: Value,
}

impl From<CommandOutcome> for CommandResponse {
    fn from(outcome: CommandOutcome) -> Self {
        Self {
            result_code: result_code(outcome.success),
            response_name: outcome.response_name,
            paras: outcome.paras,
        }
    }
}

/// `0` for success, `1` for failure
pub fn result_code(success: bool) -> u8 {
    if success {
        0
    } else {
        1
    }
}

/// Free-form message pushed on `messages/down`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct DeviceMessage {
    pub object_device_id: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub content: Value,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ServiceProperty {
    pub service_id: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct DeviceProperties {
    pub services: Vec<ServiceProperty>,
}

/// One device's properties inside a gateway batch report
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct DeviceService {
    pub device_id: String,
    pub services: Vec<ServiceProperty>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct DevicesService {
    pub devices: Vec<DeviceService>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct PropertiesSetRequest {
    pub object_device_id: Option<String>,
    pub services: Vec<ServiceProperty>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PropertiesSetResponse {
    pub result_code: u8,
    pub result_desc: String,
}

impl PropertiesSetResponse {
    pub fn new(success: bool) -> Self {
        let result_desc = if success {
            "Set property success."
        } else {
            "Set properties failed."
        };
        Self {
            result_code: result_code(success),
            result_desc: result_desc.to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct PropertyQueryRequest {
    pub object_device_id: Option<String>,
    pub service_id: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ShadowProperties {
    pub properties: Value,
    pub event_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ShadowData {
    pub service_id: String,
    pub desired: ShadowProperties,
    pub reported: ShadowProperties,
    pub version: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ShadowResponse {
    pub object_device_id: Option<String>,
    pub shadow: Vec<ShadowData>,
}

/// One service-scoped event inside an envelope
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ServiceEvent {
    pub service_id: String,
    pub event_type: String,
    #[serde(default)]
    pub event_time: String,
    #[serde(default)]
    pub paras: Value,
}

impl ServiceEvent {
    pub fn new(service_id: &str, event_type: &str, paras: impl Serialize) -> Self {
        Self {
            service_id: service_id.to_string(),
            event_type: event_type.to_string(),
            event_time: event_time(Utc::now()),
            paras: serde_json::to_value(paras).unwrap_or(Value::Null),
        }
    }
}

/// Shared shape of every event sent up or pushed down
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct EventEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_device_id: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceEvent>,
}

impl EventEnvelope {
    pub fn single(object_device_id: Option<String>, event: ServiceEvent) -> Self {
        Self {
            object_device_id,
            services: vec![event],
        }
    }
}

// Sub-device management

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub product_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_info: Option<Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct SubDeviceInfo {
    pub devices: Vec<DeviceInfo>,
    pub version: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct FailedDevice {
    pub device_id: String,
    pub product_id: String,
    pub node_id: String,
    pub error_code: String,
    pub error_msg: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct DeviceStatus {
    pub device_id: String,
    /// `ONLINE` or `OFFLINE`
    pub status: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct SubDeviceStatusResponse {
    pub successful_devices: Vec<DeviceStatus>,
    pub failed_devices: Vec<FailedDevice>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct SubDeviceAddResponse {
    pub successful_devices: Vec<DeviceInfo>,
    pub failed_devices: Vec<FailedDevice>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct SubDeviceDeleteResponse {
    pub successful_devices: Vec<String>,
    pub failed_devices: Vec<FailedDevice>,
}

// OTA

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct UpgradeInfo {
    pub version: String,
    pub url: String,
    pub file_size: i64,
    pub access_token: Option<String>,
    pub expires: i64,
    pub sign: Option<String>,
    pub task_id: Option<String>,
    pub file_name: Option<String>,
    pub custom_info: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct UpgradeProgress {
    pub result_code: i32,
    pub progress: u8,
    pub version: String,
    pub description: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct VersionReport {
    pub sw_version: String,
    pub fw_version: String,
}

// Files

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct FileUrlRequest {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_attributes: Option<Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct FileUrlResponse {
    pub url: String,
    pub bucket_name: String,
    pub object_name: String,
    pub expire: i64,
    pub file_attributes: Option<Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct FileTransferResult {
    pub object_name: String,
    pub result_code: i32,
    pub status_code: i32,
    pub status_description: String,
}

// Logs, time sync, device info

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct DeviceLogEntry {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub log_type: String,
    pub content: String,
}

/// Log collection toggle pushed with `$log/log_config`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct LogConfig {
    #[serde(alias = "LogCollectSwitch", deserialize_with = "on_off", default)]
    pub switch: bool,
    #[serde(alias = "EndTime", default)]
    pub end_time: String,
}

fn on_off<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::String(s) => Ok(s.eq_ignore_ascii_case("on") || s.eq_ignore_ascii_case("true")),
        _ => Ok(false),
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeSyncRequest {
    pub device_send_time: i64,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct TimeSyncResponse {
    pub device_send_time: i64,
    pub server_recv_time: i64,
    pub server_send_time: i64,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct DeviceInfoReport {
    pub device_sdk_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
}

/// Payload of the provisioning uplink
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ProvisioningRequest {
    #[serde(rename = "baseStrategyKeyword", skip_serializing_if = "Option::is_none")]
    pub base_strategy_keyword: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ProvisioningResponse {
    pub address: String,
    #[serde(rename = "deviceSecret")]
    pub device_secret: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_event_time_format() {
        let t = Utc.with_ymd_and_hms(2024, 3, 7, 9, 5, 1).unwrap();
        assert_eq!(event_time(t), "20240307T090501Z");
    }

    #[test]
    fn test_command_response_codes() {
        let ok: CommandResponse = CommandOutcome::success(json!({"a": 1})).into();
        assert_eq!(ok.result_code, 0);
        let body = serde_json::to_value(&ok).unwrap();
        assert_eq!(body, json!({"result_code": 0, "paras": {"a": 1}}));

        let failed: CommandResponse = CommandOutcome::failure(Value::Null).into();
        assert_eq!(failed.result_code, 1);
    }

    #[test]
    fn test_log_config_accepts_both_switch_forms() {
        let on: LogConfig =
            serde_json::from_value(json!({"switch": "on", "end_time": "x"})).unwrap();
        assert!(on.switch);
        let legacy: LogConfig =
            serde_json::from_value(json!({"LogCollectSwitch": true, "EndTime": "y"})).unwrap();
        assert!(legacy.switch);
        assert_eq!(legacy.end_time, "y");
        let off: LogConfig = serde_json::from_value(json!({"switch": "off"})).unwrap();
        assert!(!off.switch);
    }

    #[test]
    fn test_envelope_omits_missing_object_device() {
        let envelope = EventEnvelope::single(
            None,
            ServiceEvent {
                service_id: "$ota".into(),
                event_type: "version_report".into(),
                event_time: "t".into(),
                paras: json!({}),
            },
        );
        let body = serde_json::to_value(&envelope).unwrap();
        assert!(body.get("object_device_id").is_none());
        assert_eq!(body["services"][0]["service_id"], "$ota");
    }
}
