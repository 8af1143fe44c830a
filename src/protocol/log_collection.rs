//! Platform-triggered log harvesting.
//!
//! A `log_config` event switched on starts one loop per [`LogCategory`]. Each
//! loop asks the collector for the next batch and reports it until the
//! collector runs dry or collection is switched off. Every new `log_config`
//! starts a new generation; loops of an older generation stop at their next
//! iteration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rumqttc::QoS;
use tracing::{debug, info, warn};

use super::events::{event_type, LOG_SERVICE};
use super::handlers::{LogCategory, LogCollector};
use super::model::{DeviceLogEntry, EventEnvelope, LogConfig, ServiceEvent};
use crate::mqtt::topics::{device_topic, EVENTS_UP};
use crate::mqtt::Publisher;

/// One `log_report` event per entry, in a single envelope
pub fn log_envelope(entries: &[DeviceLogEntry]) -> EventEnvelope {
    EventEnvelope {
        object_device_id: None,
        services: entries
            .iter()
            .map(|entry| ServiceEvent::new(LOG_SERVICE, event_type::LOG_REPORT, entry))
            .collect(),
    }
}

/// Publishes log entries on `events/up`.
pub async fn publish_logs(publisher: &dyn Publisher, entries: &[DeviceLogEntry]) -> bool {
    let payload = match serde_json::to_vec(&log_envelope(entries)) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Failed to encode log report: {e}");
            return false;
        }
    };
    let topic = device_topic(publisher.device_id(), EVENTS_UP);
    publisher.publish(&topic, QoS::AtMostOnce, payload).await
}

pub struct LogHarvester {
    publisher: Arc<dyn Publisher>,
    collector: Option<Arc<dyn LogCollector>>,
    generation: Arc<AtomicU64>,
}

impl LogHarvester {
    pub fn new(publisher: Arc<dyn Publisher>, collector: Option<Arc<dyn LogCollector>>) -> Self {
        Self {
            publisher,
            collector,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Applies a `log_config` switch; returns how many loops were started.
    pub fn apply(&self, config: &LogConfig) -> usize {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if !config.switch {
            info!("Log collection switched off");
            return 0;
        }
        let Some(collector) = &self.collector else {
            warn!("Log collection requested but no collector is registered");
            return 0;
        };

        info!("Log collection switched on until {:?}", config.end_time);
        for category in LogCategory::ALL {
            let collector = Arc::clone(collector);
            let publisher = Arc::clone(&self.publisher);
            let current = Arc::clone(&self.generation);
            let end_time = config.end_time.clone();
            tokio::spawn(async move {
                while current.load(Ordering::SeqCst) == generation {
                    let entries = collector.collect(category, &end_time);
                    if entries.is_empty() {
                        debug!("No more {} logs", category.as_str());
                        break;
                    }
                    if !publish_logs(publisher.as_ref(), &entries).await {
                        warn!("Failed to report {} {} logs", entries.len(), category.as_str());
                    }
                    tokio::task::yield_now().await;
                }
            });
        }
        LogCategory::ALL.len()
    }

    /// Stops every running loop.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}
