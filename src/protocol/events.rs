//! Typed view of the service events carried on `events/down`.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::handlers::UpgradeKind;
use super::model::{
    FileUrlResponse, LogConfig, ServiceEvent, SubDeviceAddResponse, SubDeviceDeleteResponse,
    SubDeviceInfo, SubDeviceStatusResponse, TimeSyncResponse, UpgradeInfo,
};
use crate::error::DispatchError;
use crate::rules::model::{RuleConfigResponse, RULE_CONFIG_RESPONSE, RULE_SERVICE_ID};

pub const SUB_DEVICE_SERVICE: &str = "$sub_device_manager";
pub const FILE_SERVICE: &str = "$file_manager";
pub const OTA_SERVICE: &str = "$ota";
pub const LOG_SERVICE: &str = "$log";
pub const TIME_SYNC_SERVICE: &str = "$time_sync";
pub const SDK_INFO_SERVICE: &str = "$sdk_info";

pub mod event_type {
    pub const ADD_SUB_DEVICE_NOTIFY: &str = "add_sub_device_notify";
    pub const DELETE_SUB_DEVICE_NOTIFY: &str = "delete_sub_device_notify";
    pub const SUB_DEVICE_STATUS_RESPONSE: &str = "sub_device_update_status_response";
    pub const ADD_SUB_DEVICE_RESPONSE: &str = "add_sub_device_response";
    pub const DELETE_SUB_DEVICE_RESPONSE: &str = "delete_sub_device_response";
    pub const SUB_DEVICE_UPDATE_STATUS: &str = "sub_device_update_status";
    pub const ADD_SUB_DEVICE_REQUEST: &str = "add_sub_device_request";
    pub const DELETE_SUB_DEVICE_REQUEST: &str = "delete_sub_device_request";
    pub const SUB_DEVICE_SYNC_REQUEST: &str = "sub_device_sync_request";

    pub const GET_UPLOAD_URL: &str = "get_upload_url";
    pub const GET_DOWNLOAD_URL: &str = "get_download_url";
    pub const UPLOAD_URL_RESPONSE: &str = "get_upload_url_response";
    pub const DOWNLOAD_URL_RESPONSE: &str = "get_download_url_response";
    pub const UPLOAD_RESULT_REPORT: &str = "upload_result_report";
    pub const DOWNLOAD_RESULT_REPORT: &str = "download_result_report";

    pub const VERSION_QUERY: &str = "version_query";
    pub const VERSION_REPORT: &str = "version_report";
    pub const UPGRADE_PROGRESS_REPORT: &str = "upgrade_progress_report";

    pub const LOG_CONFIG: &str = "log_config";
    pub const LOG_REPORT: &str = "log_report";

    pub const TIME_SYNC_REQUEST: &str = "time_sync_request";
    pub const TIME_SYNC_RESPONSE: &str = "time_sync_response";

    pub const SDK_INFO_REPORT: &str = "sdk_info_report";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileAction {
    Upload,
    Download,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PlatformEvent {
    SubDevicesAdded(SubDeviceInfo),
    SubDevicesDeleted(SubDeviceInfo),
    SubDeviceStatusResponse(SubDeviceStatusResponse),
    SubDeviceAddResponse(SubDeviceAddResponse),
    SubDeviceDeleteResponse(SubDeviceDeleteResponse),
    FileUrl(FileAction, FileUrlResponse),
    VersionQuery,
    Upgrade(UpgradeKind, UpgradeInfo),
    LogConfig(LogConfig),
    TimeSync(TimeSyncResponse),
    RuleConfig(RuleConfigResponse),
    /// Anything this client does not understand; ignored
    Unknown {
        service_id: String,
        event_type: String,
    },
}

fn paras<T: DeserializeOwned>(category: &'static str, value: &Value) -> Result<T, DispatchError> {
    serde_json::from_value(value.clone()).map_err(|source| DispatchError::Decode { category, source })
}

impl PlatformEvent {
    pub fn decode(event: &ServiceEvent) -> Result<Self, DispatchError> {
        use self::event_type::*;

        let value = &event.paras;
        let decoded = match (event.service_id.as_str(), event.event_type.as_str()) {
            (SUB_DEVICE_SERVICE, ADD_SUB_DEVICE_NOTIFY) => {
                Self::SubDevicesAdded(paras(ADD_SUB_DEVICE_NOTIFY, value)?)
            }
            (SUB_DEVICE_SERVICE, DELETE_SUB_DEVICE_NOTIFY) => {
                Self::SubDevicesDeleted(paras(DELETE_SUB_DEVICE_NOTIFY, value)?)
            }
            (SUB_DEVICE_SERVICE, SUB_DEVICE_STATUS_RESPONSE) => {
                Self::SubDeviceStatusResponse(paras(SUB_DEVICE_STATUS_RESPONSE, value)?)
            }
            (SUB_DEVICE_SERVICE, ADD_SUB_DEVICE_RESPONSE) => {
                Self::SubDeviceAddResponse(paras(ADD_SUB_DEVICE_RESPONSE, value)?)
            }
            (SUB_DEVICE_SERVICE, DELETE_SUB_DEVICE_RESPONSE) => {
                Self::SubDeviceDeleteResponse(paras(DELETE_SUB_DEVICE_RESPONSE, value)?)
            }
            (FILE_SERVICE, UPLOAD_URL_RESPONSE) => {
                Self::FileUrl(FileAction::Upload, paras(UPLOAD_URL_RESPONSE, value)?)
            }
            (FILE_SERVICE, DOWNLOAD_URL_RESPONSE) => {
                Self::FileUrl(FileAction::Download, paras(DOWNLOAD_URL_RESPONSE, value)?)
            }
            (OTA_SERVICE, VERSION_QUERY) => Self::VersionQuery,
            (OTA_SERVICE, other) => match UpgradeKind::from_event_type(other) {
                Some(kind) => Self::Upgrade(kind, paras("upgrade", value)?),
                None => Self::unknown(event),
            },
            (LOG_SERVICE, LOG_CONFIG) => Self::LogConfig(paras(LOG_CONFIG, value)?),
            (TIME_SYNC_SERVICE, TIME_SYNC_RESPONSE) => {
                Self::TimeSync(paras(TIME_SYNC_RESPONSE, value)?)
            }
            (RULE_SERVICE_ID, RULE_CONFIG_RESPONSE) => {
                Self::RuleConfig(paras(RULE_CONFIG_RESPONSE, value)?)
            }
            _ => Self::unknown(event),
        };
        Ok(decoded)
    }

    fn unknown(event: &ServiceEvent) -> Self {
        Self::Unknown {
            service_id: event.service_id.clone(),
            event_type: event.event_type.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(service_id: &str, event_type: &str, paras: Value) -> ServiceEvent {
        ServiceEvent {
            service_id: service_id.into(),
            event_type: event_type.into(),
            event_time: String::new(),
            paras,
        }
    }

    #[test]
    fn test_decode_upgrade_kinds() {
        let decoded = PlatformEvent::decode(&event(
            OTA_SERVICE,
            "firmware_upgrade_v2",
            json!({"version": "2.0", "url": "https://x/fw.bin"}),
        ))
        .unwrap();
        let PlatformEvent::Upgrade(kind, info) = decoded else {
            panic!("expected an upgrade event");
        };
        assert_eq!(kind, UpgradeKind::FirmwareUrl);
        assert_eq!(info.version, "2.0");
    }

    #[test]
    fn test_decode_file_url() {
        let decoded = PlatformEvent::decode(&event(
            FILE_SERVICE,
            event_type::UPLOAD_URL_RESPONSE,
            json!({"url": "https://obs/a", "object_name": "a.log", "expire": 3600}),
        ))
        .unwrap();
        assert!(matches!(
            decoded,
            PlatformEvent::FileUrl(FileAction::Upload, ref r) if r.object_name == "a.log"
        ));
    }

    #[test]
    fn test_decode_rule_config() {
        let decoded = PlatformEvent::decode(&event(
            RULE_SERVICE_ID,
            RULE_CONFIG_RESPONSE,
            json!({"rulesInfos": [{"ruleId": "r1", "ruleVersionInShadow": 2}]}),
        ))
        .unwrap();
        let PlatformEvent::RuleConfig(config) = decoded else {
            panic!("expected rule config");
        };
        assert_eq!(config.rules_infos[0].version, 2);
    }

    #[test]
    fn test_unknown_events_are_not_errors() {
        let decoded = PlatformEvent::decode(&event("$custom", "ping", Value::Null)).unwrap();
        assert!(matches!(decoded, PlatformEvent::Unknown { .. }));
        let decoded = PlatformEvent::decode(&event(OTA_SERVICE, "rollback", Value::Null)).unwrap();
        assert!(matches!(decoded, PlatformEvent::Unknown { .. }));
    }

    #[test]
    fn test_malformed_paras_fail_decode() {
        let err = PlatformEvent::decode(&event(
            TIME_SYNC_SERVICE,
            event_type::TIME_SYNC_RESPONSE,
            json!({"device_send_time": "soon"}),
        ))
        .unwrap_err();
        assert!(matches!(err, DispatchError::Decode { category: "time_sync_response", .. }));
    }
}
