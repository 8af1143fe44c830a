//! Application extension points.
//!
//! Each concern the platform can push to the device gets a small trait. The
//! embedding application implements the ones it cares about and registers
//! them on a [`DeviceHandlers`] set. Command, property-set and property-query
//! handling are mandatory: the platform waits for a response on those.

use std::sync::Arc;

use crate::mqtt::ConnectionListener;
use crate::protocol::model::{
    Command, CommandOutcome, DeviceLogEntry, DeviceMessage, PropertiesSetRequest,
    PropertyQueryRequest, ServiceProperty, ShadowResponse, SubDeviceAddResponse,
    SubDeviceDeleteResponse, SubDeviceInfo, SubDeviceStatusResponse, TimeSyncResponse,
    UpgradeInfo, UpgradeProgress, VersionReport,
};
use crate::rules::model::RuleAction;

/// Handles commands sent to the device
pub trait CommandHandler: Send + Sync + 'static {
    /// Executes the command; the outcome is echoed back to the platform
    fn on_command(&self, command: &Command) -> CommandOutcome;
}

/// Receives free-form messages from `messages/down`
pub trait MessageHandler: Send + Sync + 'static {
    /// Called with the decoded message
    fn on_message(&self, message: &DeviceMessage);
}

/// Receives raw payloads from a topic subscribed at runtime
pub trait RawMessageHandler: Send + Sync + 'static {
    /// Called with the topic the payload arrived on
    fn on_raw_message(&self, topic: &str, payload: &[u8]);
}

/// Applies property writes pushed by the platform
pub trait PropertiesSetHandler: Send + Sync + 'static {
    /// Returns whether every property was applied
    fn on_properties_set(&self, request: &PropertiesSetRequest) -> bool;
}

/// Answers property reads issued by the platform
pub trait PropertyQueryHandler: Send + Sync + 'static {
    /// Returns the current values of the requested service
    fn on_property_query(&self, request: &PropertyQueryRequest) -> ServiceProperty;
}

/// Receives the answer to a shadow query
pub trait ShadowResponseHandler: Send + Sync + 'static {
    /// Called with the request id the query was sent with
    fn on_shadow_response(&self, request_id: Option<&str>, response: &ShadowResponse);
}

/// Gateway notifications; every method is optional
pub trait SubDeviceHandler: Send + Sync + 'static {
    /// Sub-devices were added on the platform side
    fn on_sub_devices_added(&self, _devices: &SubDeviceInfo) {}

    /// Sub-devices were deleted on the platform side
    fn on_sub_devices_deleted(&self, _devices: &SubDeviceInfo) {}

    /// Answer to a status update request
    fn on_status_response(&self, _response: &SubDeviceStatusResponse) {}

    /// Answer to an add request
    fn on_add_response(&self, _response: &SubDeviceAddResponse) {}

    /// Answer to a delete request
    fn on_delete_response(&self, _response: &SubDeviceDeleteResponse) {}
}

/// How an upgrade package is delivered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeKind {
    Software,
    Firmware,
    SoftwareUrl,
    FirmwareUrl,
}

impl UpgradeKind {
    pub fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "software_upgrade" => Some(Self::Software),
            "firmware_upgrade" => Some(Self::Firmware),
            "software_upgrade_v2" => Some(Self::SoftwareUrl),
            "firmware_upgrade_v2" => Some(Self::FirmwareUrl),
            _ => None,
        }
    }

    /// Numeric discriminator used by the platform: 0 to 3
    pub fn code(self) -> u8 {
        match self {
            Self::Software => 0,
            Self::Firmware => 1,
            Self::SoftwareUrl => 2,
            Self::FirmwareUrl => 3,
        }
    }

    /// Whether the package must be fetched from a URL
    pub fn is_url(self) -> bool {
        matches!(self, Self::SoftwareUrl | Self::FirmwareUrl)
    }
}

/// Over-the-air upgrades
pub trait OtaHandler: Send + Sync + 'static {
    /// Current software and firmware versions
    fn current_version(&self) -> VersionReport;

    /// Runs an upgrade and reports how far it got
    fn on_upgrade(&self, kind: UpgradeKind, info: &UpgradeInfo) -> UpgradeProgress;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogCategory {
    DeviceStatus,
    DeviceProperty,
    DeviceMessage,
    DeviceCommand,
}

impl LogCategory {
    pub const ALL: [LogCategory; 4] = [
        LogCategory::DeviceStatus,
        LogCategory::DeviceProperty,
        LogCategory::DeviceMessage,
        LogCategory::DeviceCommand,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceStatus => "DEVICE_STATUS",
            Self::DeviceProperty => "DEVICE_PROPERTY",
            Self::DeviceMessage => "DEVICE_MESSAGE",
            Self::DeviceCommand => "DEVICE_COMMAND",
        }
    }
}

/// Supplies device-side logs while collection is switched on
pub trait LogCollector: Send + Sync + 'static {
    /// Next batch of entries up to `end_time`; an empty batch ends collection
    fn collect(&self, category: LogCategory, end_time: &str) -> Vec<DeviceLogEntry>;
}

/// Receives time synchronisation answers
pub trait TimeSyncHandler: Send + Sync + 'static {
    /// All three timestamps are epoch milliseconds
    fn on_time_sync(&self, response: &TimeSyncResponse);
}

/// Executes the actions of a fired local rule
pub trait RuleActionHandler: Send + Sync + 'static {
    /// Called once per firing with the rule's full action list
    fn on_rule_actions(&self, actions: &[RuleAction]);
}

impl<F> CommandHandler for F
where
    F: Fn(&Command) -> CommandOutcome + Send + Sync + 'static,
{
    fn on_command(&self, command: &Command) -> CommandOutcome {
        self(command)
    }
}

impl<F> MessageHandler for F
where
    F: Fn(&DeviceMessage) + Send + Sync + 'static,
{
    fn on_message(&self, message: &DeviceMessage) {
        self(message)
    }
}

impl<F> RawMessageHandler for F
where
    F: Fn(&str, &[u8]) + Send + Sync + 'static,
{
    fn on_raw_message(&self, topic: &str, payload: &[u8]) {
        self(topic, payload)
    }
}

impl<F> PropertiesSetHandler for F
where
    F: Fn(&PropertiesSetRequest) -> bool + Send + Sync + 'static,
{
    fn on_properties_set(&self, request: &PropertiesSetRequest) -> bool {
        self(request)
    }
}

impl<F> PropertyQueryHandler for F
where
    F: Fn(&PropertyQueryRequest) -> ServiceProperty + Send + Sync + 'static,
{
    fn on_property_query(&self, request: &PropertyQueryRequest) -> ServiceProperty {
        self(request)
    }
}

impl<F> RuleActionHandler for F
where
    F: Fn(&[RuleAction]) + Send + Sync + 'static,
{
    fn on_rule_actions(&self, actions: &[RuleAction]) {
        self(actions)
    }
}

/// Everything the application registered
#[derive(Clone, Default)]
pub struct DeviceHandlers {
    pub commands: Option<Arc<dyn CommandHandler>>,
    pub messages: Vec<Arc<dyn MessageHandler>>,
    pub properties_set: Vec<Arc<dyn PropertiesSetHandler>>,
    pub property_query: Option<Arc<dyn PropertyQueryHandler>>,
    pub shadow: Option<Arc<dyn ShadowResponseHandler>>,
    pub sub_devices: Option<Arc<dyn SubDeviceHandler>>,
    pub ota: Option<Arc<dyn OtaHandler>>,
    pub logs: Option<Arc<dyn LogCollector>>,
    pub time_sync: Option<Arc<dyn TimeSyncHandler>>,
    pub rule_actions: Option<Arc<dyn RuleActionHandler>>,
    pub connection: Option<Arc<dyn ConnectionListener>>,
}

impl DeviceHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command_handler(mut self, handler: impl CommandHandler) -> Self {
        self.commands = Some(Arc::new(handler));
        self
    }

    /// Message handlers run in registration order
    pub fn with_message_handler(mut self, handler: impl MessageHandler) -> Self {
        self.messages.push(Arc::new(handler));
        self
    }

    /// All property-set handlers run; the response succeeds only if all of them do
    pub fn with_properties_set_handler(mut self, handler: impl PropertiesSetHandler) -> Self {
        self.properties_set.push(Arc::new(handler));
        self
    }

    pub fn with_property_query_handler(mut self, handler: impl PropertyQueryHandler) -> Self {
        self.property_query = Some(Arc::new(handler));
        self
    }

    pub fn with_shadow_handler(mut self, handler: impl ShadowResponseHandler) -> Self {
        self.shadow = Some(Arc::new(handler));
        self
    }

    pub fn with_sub_device_handler(mut self, handler: impl SubDeviceHandler) -> Self {
        self.sub_devices = Some(Arc::new(handler));
        self
    }

    pub fn with_ota_handler(mut self, handler: impl OtaHandler) -> Self {
        self.ota = Some(Arc::new(handler));
        self
    }

    pub fn with_log_collector(mut self, collector: impl LogCollector) -> Self {
        self.logs = Some(Arc::new(collector));
        self
    }

    pub fn with_time_sync_handler(mut self, handler: impl TimeSyncHandler) -> Self {
        self.time_sync = Some(Arc::new(handler));
        self
    }

    pub fn with_rule_action_handler(mut self, handler: impl RuleActionHandler) -> Self {
        self.rule_actions = Some(Arc::new(handler));
        self
    }

    pub fn with_connection_listener(mut self, listener: impl ConnectionListener + 'static) -> Self {
        self.connection = Some(Arc::new(listener));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upgrade_kind_codes() {
        let kinds = ["software_upgrade", "firmware_upgrade", "software_upgrade_v2", "firmware_upgrade_v2"]
            .map(|name| UpgradeKind::from_event_type(name).unwrap());
        assert_eq!(kinds.map(UpgradeKind::code), [0, 1, 2, 3]);
        assert!(!kinds[1].is_url());
        assert!(kinds[3].is_url());
        assert_eq!(UpgradeKind::from_event_type("version_query"), None);
    }

    #[test]
    fn test_closures_register_as_handlers() {
        let handlers = DeviceHandlers::new()
            .with_command_handler(|command: &Command| CommandOutcome::success(command.paras.clone()))
            .with_message_handler(|_: &DeviceMessage| {})
            .with_message_handler(|_: &DeviceMessage| {})
            .with_properties_set_handler(|_: &PropertiesSetRequest| true);

        assert_eq!(handlers.messages.len(), 2);
        assert_eq!(handlers.properties_set.len(), 1);
        let command = Command {
            paras: json!({"x": 1}),
            ..Command::default()
        };
        let outcome = handlers.commands.unwrap().on_command(&command);
        assert!(outcome.success);
        assert_eq!(outcome.paras, json!({"x": 1}));
    }
}
