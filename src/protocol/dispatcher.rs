//! Inbound message routing.
//!
//! Every message received from the broker is handed to the worker pool. The
//! worker classifies the topic, decodes the payload, calls the registered
//! handlers and publishes the correlated response where the platform expects
//! one. Nothing here panics or aborts on bad input: decode failures and
//! missing handlers are logged and the message is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use rumqttc::QoS;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use super::events::{event_type, PlatformEvent, OTA_SERVICE};
use super::file_urls::FileUrlTable;
use super::handlers::{DeviceHandlers, RawMessageHandler};
use super::log_collection::LogHarvester;
use super::model::{
    Command, CommandResponse, DeviceMessage, EventEnvelope, PropertiesSetRequest,
    PropertiesSetResponse, PropertyQueryRequest, ServiceEvent, ShadowResponse,
};
use super::worker_pool::WorkerPool;
use crate::error::{DispatchError, PoolError};
use crate::mqtt::topics::{
    device_topic, filter_matches, request_id, response_topic, TopicCategory, COMMAND_RESPONSE,
    EVENTS_UP, PROPERTIES_GET_RESPONSE, PROPERTIES_SET_RESPONSE,
};
use crate::mqtt::{InboundMessage, Publisher};
use crate::rules::{RuleEngine, RULE_SERVICE_ID};

fn decode<T: DeserializeOwned>(category: TopicCategory, payload: &[u8]) -> Result<T, DispatchError> {
    serde_json::from_slice(payload).map_err(|source| DispatchError::Decode {
        category: category.name(),
        source,
    })
}

pub struct Dispatcher {
    publisher: Arc<dyn Publisher>,
    handlers: DeviceHandlers,
    custom: RwLock<HashMap<String, Arc<dyn RawMessageHandler>>>,
    rules: Option<Arc<RuleEngine>>,
    file_urls: FileUrlTable,
    logs: LogHarvester,
    pool: WorkerPool,
}

impl Dispatcher {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        handlers: DeviceHandlers,
        rules: Option<Arc<RuleEngine>>,
        file_urls: FileUrlTable,
        pool_size: usize,
    ) -> Self {
        let logs = LogHarvester::new(Arc::clone(&publisher), handlers.logs.clone());
        Self {
            publisher,
            handlers,
            custom: RwLock::new(HashMap::new()),
            rules,
            file_urls,
            logs,
            pool: WorkerPool::new(pool_size),
        }
    }

    fn device_id(&self) -> &str {
        self.publisher.device_id()
    }

    /// Routes messages matching the `filter` (MQTT wildcards allowed) to `handler`.
    pub async fn register_custom(&self, filter: &str, handler: Arc<dyn RawMessageHandler>) {
        self.custom.write().await.insert(filter.to_string(), handler);
    }

    /// Feeds every inbound message to the pool until the queue closes.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        info!("Dispatcher started with {} workers", self.pool.size());
        while let Some(message) = inbound.recv().await {
            self.submit(message);
        }
        debug!("Inbound queue closed");
    }

    /// Hands one message to the pool; drops it when the pool is full.
    pub fn submit(self: &Arc<Self>, message: InboundMessage) {
        let this = Arc::clone(self);
        let topic = message.topic.clone();
        let submitted = self.pool.submit(async move {
            if let Err(e) = this.dispatch(&message).await {
                match e {
                    DispatchError::MissingHandler(_) => error!("{e} for {}", message.topic),
                    _ => warn!("Dropping message on {}: {e}", message.topic),
                }
            }
        });
        match submitted {
            Ok(()) => {}
            Err(PoolError::Saturated) => warn!("Worker pool saturated, dropping message on {topic}"),
            Err(PoolError::Closed) => debug!("Worker pool closed, dropping message on {topic}"),
        }
    }

    /// Stops accepting messages and switches off log collection.
    pub fn close(&self) {
        self.pool.close();
        self.logs.stop();
    }

    pub async fn dispatch(&self, message: &InboundMessage) -> Result<(), DispatchError> {
        if let Some(handler) = self.custom_handler(&message.topic).await {
            handler.on_raw_message(&message.topic, &message.payload);
            return Ok(());
        }

        let category = TopicCategory::classify(&message.topic);
        debug!("Inbound {} message on {}", category.name(), message.topic);
        match category {
            TopicCategory::MessageDown => self.on_message_down(category, &message.payload),
            TopicCategory::Command => self.on_command(category, message).await,
            TopicCategory::PropertiesSet => self.on_properties_set(category, message).await,
            TopicCategory::PropertiesGet => self.on_property_query(category, message).await,
            TopicCategory::ShadowResponse => self.on_shadow_response(category, message),
            TopicCategory::EventDown => self.on_events(category, &message.payload).await,
            TopicCategory::Unknown => {
                debug!("No route for {}", message.topic);
                Ok(())
            }
        }
    }

    async fn custom_handler(&self, topic: &str) -> Option<Arc<dyn RawMessageHandler>> {
        let custom = self.custom.read().await;
        if let Some(handler) = custom.get(topic) {
            return Some(Arc::clone(handler));
        }
        custom
            .iter()
            .find(|(filter, _)| filter_matches(filter, topic))
            .map(|(_, handler)| Arc::clone(handler))
    }

    fn on_message_down(&self, category: TopicCategory, payload: &[u8]) -> Result<(), DispatchError> {
        let message: DeviceMessage = decode(category, payload)?;
        for handler in &self.handlers.messages {
            handler.on_message(&message);
        }
        Ok(())
    }

    async fn on_command(&self, category: TopicCategory, message: &InboundMessage) -> Result<(), DispatchError> {
        let command: Command = decode(category, &message.payload)?;
        let handler = self
            .handlers
            .commands
            .as_ref()
            .ok_or(DispatchError::MissingHandler("command"))?;
        let topic = self.response_topic(COMMAND_RESPONSE, &message.topic)?;

        let outcome = handler.on_command(&command);
        info!(
            "Command {}/{} handled: success={}",
            command.service_id, command.command_name, outcome.success
        );
        let response = CommandResponse::from(outcome);
        self.respond(&topic, QoS::AtLeastOnce, &response).await;
        Ok(())
    }

    async fn on_properties_set(
        &self,
        category: TopicCategory,
        message: &InboundMessage,
    ) -> Result<(), DispatchError> {
        let request: PropertiesSetRequest = decode(category, &message.payload)?;
        let topic = self.response_topic(PROPERTIES_SET_RESPONSE, &message.topic)?;

        let mut rule_only = !request.services.is_empty();
        if let Some(engine) = &self.rules {
            for service in &request.services {
                if service.service_id.contains(RULE_SERVICE_ID) {
                    engine.modify_rules(&service.properties).await;
                } else {
                    rule_only = false;
                }
            }
        } else {
            rule_only = false;
        }

        let handlers = &self.handlers.properties_set;
        if handlers.is_empty() && !rule_only {
            return Err(DispatchError::MissingHandler("properties-set"));
        }
        // every handler runs even after one fails
        let success = handlers
            .iter()
            .fold(true, |all, handler| handler.on_properties_set(&request) && all);

        let response = PropertiesSetResponse::new(success);
        self.respond(&topic, self.publisher.default_qos(), &response).await;
        Ok(())
    }

    async fn on_property_query(
        &self,
        category: TopicCategory,
        message: &InboundMessage,
    ) -> Result<(), DispatchError> {
        let request: PropertyQueryRequest = decode(category, &message.payload)?;
        let handler = self
            .handlers
            .property_query
            .as_ref()
            .ok_or(DispatchError::MissingHandler("property-query"))?;
        let topic = self.response_topic(PROPERTIES_GET_RESPONSE, &message.topic)?;

        let entry = handler.on_property_query(&request);
        self.respond(&topic, self.publisher.default_qos(), &entry).await;
        Ok(())
    }

    fn on_shadow_response(&self, category: TopicCategory, message: &InboundMessage) -> Result<(), DispatchError> {
        let response: ShadowResponse = decode(category, &message.payload)?;
        match &self.handlers.shadow {
            Some(handler) => handler.on_shadow_response(request_id(&message.topic), &response),
            None => debug!("No shadow handler registered"),
        }
        Ok(())
    }

    async fn on_events(&self, category: TopicCategory, payload: &[u8]) -> Result<(), DispatchError> {
        let envelope: EventEnvelope = decode(category, payload)?;
        for event in &envelope.services {
            // one bad event must not hide the others
            match PlatformEvent::decode(event) {
                Ok(decoded) => self.on_event(decoded).await,
                Err(e) => warn!("Dropping {} event {}: {e}", event.service_id, event.event_type),
            }
        }
        Ok(())
    }

    async fn on_event(&self, event: PlatformEvent) {
        let sub_devices = self.handlers.sub_devices.as_deref();
        match event {
            PlatformEvent::SubDevicesAdded(info) => {
                if let Some(handler) = sub_devices {
                    handler.on_sub_devices_added(&info);
                }
            }
            PlatformEvent::SubDevicesDeleted(info) => {
                if let Some(handler) = sub_devices {
                    handler.on_sub_devices_deleted(&info);
                }
            }
            PlatformEvent::SubDeviceStatusResponse(response) => {
                if let Some(handler) = sub_devices {
                    handler.on_status_response(&response);
                }
            }
            PlatformEvent::SubDeviceAddResponse(response) => {
                if let Some(handler) = sub_devices {
                    handler.on_add_response(&response);
                }
            }
            PlatformEvent::SubDeviceDeleteResponse(response) => {
                if let Some(handler) = sub_devices {
                    handler.on_delete_response(&response);
                }
            }
            PlatformEvent::FileUrl(action, response) => {
                debug!("File url for {} ({action:?})", response.object_name);
                self.file_urls.insert(action, response).await;
            }
            PlatformEvent::VersionQuery => match &self.handlers.ota {
                Some(ota) => {
                    let version = ota.current_version();
                    self.report_ota(event_type::VERSION_REPORT, &version).await;
                }
                None => debug!("Version query ignored: no OTA handler"),
            },
            PlatformEvent::Upgrade(kind, info) => match &self.handlers.ota {
                Some(ota) => {
                    info!("Upgrade to {} requested ({kind:?})", info.version);
                    let progress = ota.on_upgrade(kind, &info);
                    self.report_ota(event_type::UPGRADE_PROGRESS_REPORT, &progress).await;
                }
                None => warn!("Upgrade ignored: no OTA handler"),
            },
            PlatformEvent::LogConfig(config) => {
                self.logs.apply(&config);
            }
            PlatformEvent::TimeSync(response) => {
                if let Some(handler) = &self.handlers.time_sync {
                    handler.on_time_sync(&response);
                }
            }
            PlatformEvent::RuleConfig(config) => match &self.rules {
                Some(engine) => engine.apply_config_response(config.rules_infos).await,
                None => debug!("Rule config ignored: rule engine disabled"),
            },
            PlatformEvent::Unknown {
                service_id,
                event_type,
            } => debug!("Ignoring event {service_id}/{event_type}"),
        }
    }

    async fn report_ota<T: Serialize>(&self, event_type: &str, paras: &T) {
        let envelope = EventEnvelope::single(
            Some(self.device_id().to_string()),
            ServiceEvent::new(OTA_SERVICE, event_type, paras),
        );
        let topic = device_topic(self.device_id(), EVENTS_UP);
        self.respond(&topic, self.publisher.default_qos(), &envelope).await;
    }

    fn response_topic(&self, template: &str, inbound: &str) -> Result<String, DispatchError> {
        response_topic(self.device_id(), template, inbound)
            .ok_or_else(|| DispatchError::MissingRequestId(inbound.to_string()))
    }

    async fn respond<T: Serialize + ?Sized>(&self, topic: &str, qos: QoS, body: &T) {
        let payload = match serde_json::to_vec(body) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode response for {topic}: {e}");
                return;
            }
        };
        if !self.publisher.publish(topic, qos, payload).await {
            warn!("Failed to publish response to {topic}");
        }
    }
}
