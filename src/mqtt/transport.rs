//! The publish/subscribe transport seam.
//!
//! A [`Transport`] opens sessions; each [`TransportSession`] is one
//! authenticated broker connection. Inbound messages and connection loss
//! are reported through the [`EventSink`] handed to `connect`, tagged with
//! the session number so late events from a replaced session can be told
//! apart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tracing::warn;

use super::tls::TlsMaterial;
use crate::config::BrokerAddress;
use crate::error::TransportError;

#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub broker: BrokerAddress,
    pub client_id: String,
    pub username: String,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Bound on each publish or subscribe handed to the session
    pub operation_timeout: Duration,
    pub inflight: u16,
    pub tls: Option<Arc<TlsMaterial>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Message {
        session: u64,
        topic: String,
        payload: Vec<u8>,
    },
    ConnectionLost {
        session: u64,
        reason: String,
    },
}

/// Where a session reports inbound traffic and connection loss.
#[derive(Clone, Debug)]
pub struct EventSink {
    session: u64,
    tx: mpsc::Sender<TransportEvent>,
}

impl EventSink {
    pub fn new(session: u64, tx: mpsc::Sender<TransportEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub async fn message(&self, topic: String, payload: Vec<u8>) {
        let event = TransportEvent::Message {
            session: self.session,
            topic,
            payload,
        };
        if self.tx.send(event).await.is_err() {
            warn!("Inbound message dropped, event receiver closed");
        }
    }

    pub async fn connection_lost(&self, reason: String) {
        let event = TransportEvent::ConnectionLost {
            session: self.session,
            reason,
        };
        if self.tx.send(event).await.is_err() {
            warn!("Connection loss not reported, event receiver closed");
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a session and resolves once the broker acknowledged the connection.
    async fn connect(
        &self,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    /// Closes the session without reporting it as lost.
    async fn disconnect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}
