//! Application-facing device facade.
//!
//! [`IotDevice`] wires the connection manager, the dispatcher and the local
//! rule engine together and exposes the uplink operations of a device or
//! gateway. Every operation returns `true` only when the message was handed
//! to a live session; while disconnected, publishes are buffered (if the
//! offline buffer is enabled) and the call returns `false`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::DeviceConfig;
use crate::error::ConfigError;
use crate::mqtt::topics::{
    device_topic, EVENTS_UP, GATEWAY_PROPERTIES_REPORT, MESSAGES_UP, PROPERTIES_REPORT, SHADOW_GET,
};
use crate::mqtt::{
    publish_json, ConnectionManager, InboundMessage, Publisher, RumqttTransport, Transport,
};
use crate::protocol::events::{
    event_type, FILE_SERVICE, SDK_INFO_SERVICE, SUB_DEVICE_SERVICE, TIME_SYNC_SERVICE,
};
use crate::protocol::log_collection::publish_logs;
use crate::protocol::model::{
    DeviceInfo, DeviceInfoReport, DeviceLogEntry, DeviceMessage, DeviceService, DeviceStatus,
    DevicesService, EventEnvelope, FileTransferResult, FileUrlRequest, FileUrlResponse,
    PropertyQueryRequest, ServiceEvent, ServiceProperty, TimeSyncRequest,
};
use crate::protocol::{
    DeviceHandlers, Dispatcher, FileAction, FileUrlTable, RawMessageHandler, RuleActionHandler,
};
use crate::rules::{CommandActionHandler, RuleEngine};

pub const SDK_VERSION: &str = concat!("devicelink-rust-", env!("CARGO_PKG_VERSION"));

pub struct IotDevice {
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<Dispatcher>,
    rules: Option<Arc<RuleEngine>>,
    file_urls: FileUrlTable,
    inbound: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl IotDevice {
    /// Builds a device that talks to the broker through rumqttc.
    pub fn new(config: DeviceConfig, handlers: DeviceHandlers) -> Result<Self, ConfigError> {
        Self::with_transport(config, Arc::new(RumqttTransport), handlers)
    }

    /// Builds a device on top of any [`Transport`].
    ///
    /// The configuration is validated and TLS material loaded here; nothing
    /// touches the network until [`connect`](Self::connect).
    pub fn with_transport(
        config: DeviceConfig,
        transport: Arc<dyn Transport>,
        handlers: DeviceHandlers,
    ) -> Result<Self, ConfigError> {
        let config = Arc::new(config.validate()?);
        let (connection, inbound) =
            ConnectionManager::new(Arc::clone(&config), transport, handlers.connection.clone())?;
        let publisher: Arc<dyn Publisher> = connection.clone();

        let rules = config.connection.rule_engine_enabled.then(|| {
            let actions: Arc<dyn RuleActionHandler> = match &handlers.rule_actions {
                Some(actions) => Arc::clone(actions),
                None => Arc::new(CommandActionHandler::new(
                    config.identity.device_id.clone(),
                    handlers.commands.clone(),
                )),
            };
            Arc::new(RuleEngine::new(Arc::clone(&publisher), actions))
        });

        let file_urls = FileUrlTable::new();
        let dispatcher = Arc::new(Dispatcher::new(
            publisher,
            handlers,
            rules.clone(),
            file_urls.clone(),
            config.connection.worker_pool_size,
        ));

        Ok(Self {
            connection,
            dispatcher,
            rules,
            file_urls,
            inbound: Mutex::new(Some(inbound)),
            dispatch_task: Mutex::new(None),
        })
    }

    pub fn device_id(&self) -> &str {
        self.connection.device_id()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn rule_engine(&self) -> Option<&Arc<RuleEngine>> {
        self.rules.as_ref()
    }

    /// Starts dispatching and connects, retrying per the backoff policy.
    pub async fn connect(&self) -> bool {
        if let Some(inbound) = self.inbound.lock().await.take() {
            let dispatcher = Arc::clone(&self.dispatcher);
            *self.dispatch_task.lock().await = Some(tokio::spawn(dispatcher.run(inbound)));
        }
        self.connection.connect().await
    }

    /// Closes the session for good and releases the worker pool and rule timers.
    pub async fn disconnect(&self) -> bool {
        let closed = self.connection.disconnect().await;
        self.dispatcher.close();
        if let Some(task) = self.dispatch_task.lock().await.take() {
            task.abort();
        }
        if let Some(rules) = &self.rules {
            rules.shutdown().await;
        }
        info!("Device {} shut down", self.device_id());
        closed
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn topic(&self, suffix: &str) -> String {
        device_topic(self.device_id(), suffix)
    }

    async fn publish<T: Serialize + ?Sized>(&self, topic: &str, body: &T) -> bool {
        publish_json(self.connection.as_ref(), topic, body).await
    }

    async fn publish_event(&self, service_id: &str, event_type: &str, paras: impl Serialize) -> bool {
        let envelope = EventEnvelope::single(
            Some(self.device_id().to_string()),
            ServiceEvent::new(service_id, event_type, paras),
        );
        self.report_event(&envelope).await
    }

    // Reporting

    /// Publishes on `messages/up`.
    ///
    /// `true` means the broker session accepted the message. `false` covers
    /// two cases: while disconnected with the offline buffer enabled the
    /// message is queued and sent after the next connect, otherwise it is
    /// lost. [`ConnectionManager::buffered`] tells how many are queued.
    pub async fn send_message(&self, message: &DeviceMessage) -> bool {
        self.publish(&self.topic(MESSAGES_UP), message).await
    }

    /// Publishes a message on an application-defined topic.
    pub async fn send_message_to(&self, topic: &str, message: &DeviceMessage) -> bool {
        self.publish(topic, message).await
    }

    /// Reports properties and, when the rule engine is on, evaluates
    /// device-data rules against the reported values.
    pub async fn report_properties(&self, services: &[ServiceProperty]) -> bool {
        let body = json!({ "services": services });
        let sent = self.publish(&self.topic(PROPERTIES_REPORT), &body).await;
        if sent {
            if let Some(rules) = &self.rules {
                rules.evaluate_report(services).await;
            }
        }
        sent
    }

    /// Reports sub-device properties in batches of the configured size.
    pub async fn batch_report_sub_device_properties(&self, devices: &[DeviceService]) -> bool {
        let batch = self.connection.config().connection.sub_device_batch_size.max(1);
        let topic = self.topic(GATEWAY_PROPERTIES_REPORT);
        for chunk in devices.chunks(batch) {
            let body = DevicesService {
                devices: chunk.to_vec(),
            };
            if !self.publish(&topic, &body).await {
                warn!("Sub-device property batch of {} failed", chunk.len());
                return false;
            }
        }
        true
    }

    /// Asks for the shadow of `service_id` (all services when `None`).
    ///
    /// Returns the request id the answer will carry.
    pub async fn query_device_shadow(&self, service_id: Option<&str>) -> Option<String> {
        let request_id = hex::encode(rand::random::<[u8; 16]>());
        let query = PropertyQueryRequest {
            object_device_id: Some(self.device_id().to_string()),
            service_id: service_id.unwrap_or_default().to_string(),
        };
        let topic = format!("{}{request_id}", self.topic(SHADOW_GET));
        if self.publish(&topic, &query).await {
            Some(request_id)
        } else {
            warn!("Shadow query {request_id} was not sent");
            None
        }
    }

    /// Publishes any event envelope on `events/up`.
    pub async fn report_event(&self, envelope: &EventEnvelope) -> bool {
        self.publish(&self.topic(EVENTS_UP), envelope).await
    }

    pub async fn report_device_info(&self, sw_version: Option<&str>, fw_version: Option<&str>) -> bool {
        let report = DeviceInfoReport {
            device_sdk_version: SDK_VERSION.to_string(),
            sw_version: sw_version.map(str::to_string),
            fw_version: fw_version.map(str::to_string),
        };
        self.publish_event(SDK_INFO_SERVICE, event_type::SDK_INFO_REPORT, report)
            .await
    }

    pub async fn report_logs(&self, entries: &[DeviceLogEntry]) -> bool {
        publish_logs(self.connection.as_ref(), entries).await
    }

    pub async fn request_time_sync(&self) -> bool {
        let request = TimeSyncRequest {
            device_send_time: Utc::now().timestamp_millis(),
        };
        self.publish_event(TIME_SYNC_SERVICE, event_type::TIME_SYNC_REQUEST, request)
            .await
    }

    // Gateway

    /// Reports sub-device online states in batches of the configured size.
    pub async fn update_sub_device_states(&self, statuses: &[DeviceStatus]) -> bool {
        let batch = self.connection.config().connection.sub_device_batch_size.max(1);
        for chunk in statuses.chunks(batch) {
            let paras = json!({ "device_statuses": chunk });
            if !self
                .publish_event(SUB_DEVICE_SERVICE, event_type::SUB_DEVICE_UPDATE_STATUS, paras)
                .await
            {
                warn!("Sub-device status batch of {} failed", chunk.len());
                return false;
            }
        }
        true
    }

    pub async fn add_sub_devices(&self, devices: &[DeviceInfo]) -> bool {
        let paras = json!({ "devices": devices });
        self.publish_event(SUB_DEVICE_SERVICE, event_type::ADD_SUB_DEVICE_REQUEST, paras)
            .await
    }

    pub async fn delete_sub_devices(&self, device_ids: &[String]) -> bool {
        let paras = json!({ "devices": device_ids });
        self.publish_event(SUB_DEVICE_SERVICE, event_type::DELETE_SUB_DEVICE_REQUEST, paras)
            .await
    }

    /// Requests sub-device changes newer than `version`, or the full list when `None`.
    pub async fn sync_sub_devices(&self, version: Option<i64>) -> bool {
        let paras = match version {
            Some(version) => json!({ "version": version }),
            None => json!({}),
        };
        self.publish_event(SUB_DEVICE_SERVICE, event_type::SUB_DEVICE_SYNC_REQUEST, paras)
            .await
    }

    // Files

    async fn request_file_url(&self, action: FileAction, request: FileUrlRequest) -> bool {
        self.file_urls.forget(&request.file_name, action).await;
        let event = match action {
            FileAction::Upload => event_type::GET_UPLOAD_URL,
            FileAction::Download => event_type::GET_DOWNLOAD_URL,
        };
        self.publish_event(FILE_SERVICE, event, request).await
    }

    /// Asks the platform for an upload URL; collect it with [`wait_file_url`](Self::wait_file_url).
    pub async fn request_upload_url(&self, request: FileUrlRequest) -> bool {
        self.request_file_url(FileAction::Upload, request).await
    }

    pub async fn request_download_url(&self, request: FileUrlRequest) -> bool {
        self.request_file_url(FileAction::Download, request).await
    }

    pub async fn wait_file_url(
        &self,
        object_name: &str,
        action: FileAction,
        timeout: Duration,
    ) -> Option<FileUrlResponse> {
        self.file_urls.wait(object_name, action, timeout).await
    }

    pub async fn report_upload_result(&self, result: &FileTransferResult) -> bool {
        self.publish_event(FILE_SERVICE, event_type::UPLOAD_RESULT_REPORT, result)
            .await
    }

    pub async fn report_download_result(&self, result: &FileTransferResult) -> bool {
        self.publish_event(FILE_SERVICE, event_type::DOWNLOAD_RESULT_REPORT, result)
            .await
    }

    /// Subscribes to `topic` now and after every reconnect; payloads go to `handler`.
    ///
    /// Returns `false` when the subscription is only queued for the next connect.
    pub async fn subscribe_custom_topic(&self, topic: &str, handler: impl RawMessageHandler) -> bool {
        self.dispatcher.register_custom(topic, Arc::new(handler)).await;
        self.connection.subscribe_topic(topic).await
    }
}
