//! One-shot provisioning handshake.
//!
//! The device connects to the provisioning broker, subscribes to its
//! `bootstrap/down` topic and publishes its request on `bootstrap/up`. The
//! first response resolves a [`ProvisioningSession`]; anything after that is
//! ignored.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rumqttc::QoS;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::topics::{device_topic, BOOTSTRAP_DOWN, BOOTSTRAP_UP};
use super::transport::{ConnectOptions, EventSink, Transport, TransportEvent};
use crate::error::{HandshakeError, TransportError};
use crate::persistence::ServerRecord;
use crate::protocol::model::{ProvisioningRequest, ProvisioningResponse};

pub const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TLS_PORT: u16 = 8883;

type SlotSender = oneshot::Sender<Result<ServerRecord, HandshakeError>>;

/// Writing half of a [`ProvisioningSession`]; completes it at most once.
#[derive(Clone)]
pub struct ProvisioningCompleter {
    slot: Arc<Mutex<Option<SlotSender>>>,
}

impl ProvisioningCompleter {
    pub fn complete(&self, result: Result<ServerRecord, HandshakeError>) -> Result<(), HandshakeError> {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(result).map_err(|_| HandshakeError::Abandoned),
            None => Err(HandshakeError::AlreadyCompleted),
        }
    }
}

/// Pending provisioning result
pub struct ProvisioningSession {
    rx: oneshot::Receiver<Result<ServerRecord, HandshakeError>>,
}

impl ProvisioningSession {
    pub fn new() -> (ProvisioningCompleter, Self) {
        let (tx, rx) = oneshot::channel();
        let completer = ProvisioningCompleter {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (completer, Self { rx })
    }

    pub async fn wait(self, timeout: Duration) -> Result<ServerRecord, HandshakeError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HandshakeError::Abandoned),
            Err(_) => Err(HandshakeError::Timeout(timeout)),
        }
    }
}

pub fn parse_response(payload: &[u8]) -> Result<ServerRecord, HandshakeError> {
    let response: ProvisioningResponse = serde_json::from_slice(payload)?;
    let address = response.address.trim();
    if address.is_empty() {
        return Err(HandshakeError::MissingAddress);
    }
    let port = address
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(DEFAULT_TLS_PORT);
    Ok(ServerRecord {
        server_uri: format!("tls://{address}"),
        secret: response.device_secret.unwrap_or_default(),
        port,
    })
}

/// Runs the handshake against the provisioning broker described by `options`.
pub async fn provision(
    transport: &dyn Transport,
    options: &ConnectOptions,
    device_id: &str,
    request: &ProvisioningRequest,
    timeout: Duration,
) -> Result<ServerRecord, HandshakeError> {
    let (events_tx, mut events_rx) = mpsc::channel(16);
    let session = transport
        .connect(options, EventSink::new(0, events_tx))
        .await?;

    let down = device_topic(device_id, BOOTSTRAP_DOWN);
    let up = device_topic(device_id, BOOTSTRAP_UP);
    let (completer, pending) = ProvisioningSession::new();

    let listen_topic = down.clone();
    let listener = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let outcome = match event {
                TransportEvent::Message { topic, payload, .. } if topic == listen_topic => {
                    completer.complete(parse_response(&payload))
                }
                TransportEvent::ConnectionLost { reason, .. } => {
                    completer.complete(Err(TransportError::Connect(reason).into()))
                }
                TransportEvent::Message { topic, .. } => {
                    debug!("Ignoring {topic} during provisioning");
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                warn!("Provisioning event not applied: {e}");
            }
        }
    });

    let result: Result<ServerRecord, HandshakeError> = async {
        session.subscribe(&down, QoS::AtLeastOnce).await?;
        let payload = serde_json::to_vec(request)?;
        session.publish(&up, QoS::AtLeastOnce, payload).await?;
        pending.wait(timeout).await
    }
    .await;

    listener.abort();
    if let Err(e) = session.disconnect().await {
        debug!("Provisioning session close failed: {e}");
    }

    if let Ok(record) = &result {
        info!("Provisioned broker {}", record.server_uri);
    }
    result
}
