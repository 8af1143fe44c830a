//! Scripted in-memory transport shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use devicelink::config::{ConnectionConfig, DeviceConfig, DeviceIdentity};
use devicelink::error::TransportError;
use devicelink::mqtt::{ConnectOptions, EventSink, Transport, TransportSession};
use rumqttc::QoS;
use serde_json::Value;

pub const DEVICE_ID: &str = "dev-1";

#[derive(Clone, Debug)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).expect("payload is json")
    }
}

#[derive(Default)]
struct State {
    connects: usize,
    failures: VecDeque<String>,
    published: Vec<Published>,
    subscribed: Vec<String>,
    sink: Option<EventSink>,
    options: Vec<ConnectOptions>,
    bootstrap_reply: Option<Value>,
    unanswered_bootstraps: usize,
    connect_delay: Option<Duration>,
    disconnects: usize,
}

/// Accepts every connect unless a failure was queued with [`fail_next`](Self::fail_next)
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<State>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, times: usize) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..times {
            state.failures.push_back("broker unreachable".into());
        }
    }

    /// Holds every connect for `delay` before answering.
    pub fn delay_connects(&self, delay: Duration) {
        self.state.lock().unwrap().connect_delay = Some(delay);
    }

    /// Leaves the next `times` provisioning requests without a reply.
    pub fn ignore_bootstrap(&self, times: usize) {
        self.state.lock().unwrap().unanswered_bootstraps = times;
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    /// Answers every provisioning request with `reply`.
    pub fn reply_to_bootstrap(&self, reply: Value) {
        self.state.lock().unwrap().bootstrap_reply = Some(reply);
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn published_on(&self, suffix: &str) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| p.topic.ends_with(suffix))
            .collect()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.state.lock().unwrap().subscribed.clone()
    }

    pub fn last_options(&self) -> Option<ConnectOptions> {
        self.state.lock().unwrap().options.last().cloned()
    }

    fn sink(&self) -> EventSink {
        self.state
            .lock()
            .unwrap()
            .sink
            .clone()
            .expect("no session opened yet")
    }

    /// Delivers a message on the current session.
    pub async fn inject(&self, topic: &str, payload: Value) {
        let sink = self.sink();
        sink.message(topic.to_string(), serde_json::to_vec(&payload).unwrap())
            .await;
    }

    /// Reports the current session as lost.
    pub async fn drop_session(&self) {
        let sink = self.sink();
        sink.connection_lost("socket closed".into()).await;
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let delay = self.state.lock().unwrap().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        state.options.push(options.clone());
        if let Some(reason) = state.failures.pop_front() {
            return Err(TransportError::Connect(reason));
        }
        state.sink = Some(events.clone());
        Ok(Arc::new(ScriptedSession {
            state: Arc::clone(&self.state),
            sink: events,
        }))
    }
}

struct ScriptedSession {
    state: Arc<Mutex<State>>,
    sink: EventSink,
}

#[async_trait]
impl TransportSession for ScriptedSession {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.published.push(Published {
                topic: topic.to_string(),
                qos,
                payload,
            });
            if topic.ends_with("sys/bootstrap/up") && state.unanswered_bootstraps > 0 {
                state.unanswered_bootstraps -= 1;
                None
            } else {
                state.bootstrap_reply.clone()
            }
        };
        if let (Some(reply), Some(prefix)) = (reply, topic.strip_suffix("sys/bootstrap/up")) {
            let sink = self.sink.clone();
            let down = format!("{prefix}sys/bootstrap/down");
            tokio::spawn(async move {
                sink.message(down, serde_json::to_vec(&reply).unwrap()).await;
            });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        self.state.lock().unwrap().subscribed.push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.state.lock().unwrap().disconnects += 1;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

pub fn device_config() -> DeviceConfig {
    DeviceConfig {
        identity: DeviceIdentity {
            device_id: DEVICE_ID.into(),
            secret: Some("s3cret".into()),
            ..DeviceIdentity::default()
        },
        connection: ConnectionConfig {
            server: "tcp://127.0.0.1:1883".into(),
            qos: 1,
            ..ConnectionConfig::default()
        },
    }
}

pub fn topic(suffix: &str) -> String {
    format!("$oc/devices/{DEVICE_ID}/{suffix}")
}

/// Lets spawned dispatcher and pool tasks run to completion.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Polls `check` until it holds, giving background tasks time to run.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
