//! Session lifecycle: connect with backoff, reconnect on loss, and buffer
//! outbound traffic while the broker is unreachable.
//!
//! A single supervisor task owns the transport event stream. It forwards
//! inbound messages to the dispatcher queue and runs the reconnection loop
//! when the current session reports loss. Application calls to
//! [`ConnectionManager::connect`] run the same loop on the caller's task, so
//! the caller waits until a session is up (or reconnection is disabled).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::QoS;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffState;
use super::credentials::{device_credentials, provisioning_credentials, Credentials};
use super::offline_buffer::{BufferedMessage, OfflineBuffer};
use super::provisioning::{provision, PROVISIONING_TIMEOUT};
use super::tls::TlsMaterial;
use super::topics::{device_topic, DEVICE_SUBSCRIPTIONS};
use super::transport::{
    qos_from_level, ConnectOptions, EventSink, Transport, TransportEvent, TransportSession,
};
use crate::config::{BrokerAddress, DeviceConfig};
use crate::error::{ConfigError, ConnectError, HandshakeError, TransportError};
use crate::persistence::{ServerRecord, ServerRecordStore};
use crate::protocol::model::ProvisioningRequest;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Inbound (topic, payload) pair handed to the dispatcher
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Notified when a session comes up or is lost
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self) {}

    fn on_connection_lost(&self, _reason: &str) {}
}

/// Outbound publishing capability shared with the dispatcher and rule engine
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns `true` once the transport accepted the message.
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> bool;

    async fn subscribe(&self, topic: &str) -> bool;

    fn device_id(&self) -> &str;

    fn default_qos(&self) -> QoS;
}

pub async fn publish_json<T: Serialize + ?Sized>(
    publisher: &dyn Publisher,
    topic: &str,
    body: &T,
) -> bool {
    match serde_json::to_vec(body) {
        Ok(payload) => publisher.publish(topic, publisher.default_qos(), payload).await,
        Err(e) => {
            error!("Failed to encode payload for {topic}: {e}");
            false
        }
    }
}

pub struct ConnectionManager {
    config: Arc<DeviceConfig>,
    transport: Arc<dyn Transport>,
    tls: Option<Arc<TlsMaterial>>,
    qos: QoS,
    listener: Option<Arc<dyn ConnectionListener>>,

    session: RwLock<Option<Arc<dyn TransportSession>>>,
    session_counter: AtomicU64,
    current_session: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,

    backoff: Mutex<BackoffState>,
    buffer: Mutex<OfflineBuffer>,
    records: ServerRecordStore,
    server_record: RwLock<Option<ServerRecord>>,
    custom_topics: RwLock<Vec<String>>,

    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    connect_lock: Mutex<()>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Builds the manager and the queue inbound messages are delivered on.
    ///
    /// TLS material is loaded here; an unreadable trust root is fatal.
    pub fn new(
        config: Arc<DeviceConfig>,
        transport: Arc<dyn Transport>,
        listener: Option<Arc<dyn ConnectionListener>>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<InboundMessage>), ConfigError> {
        let tls = load_tls(&config)?;
        let conn = &config.connection;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        let manager = Arc::new(Self {
            qos: qos_from_level(conn.qos),
            tls,
            listener,
            session: RwLock::new(None),
            session_counter: AtomicU64::new(0),
            current_session: AtomicU64::new(0),
            state_tx,
            backoff: Mutex::new(BackoffState::new(conn.backoff)),
            buffer: Mutex::new(OfflineBuffer::new(conn.offline_buffer_capacity)),
            records: ServerRecordStore::new(conn.server_record_path()),
            server_record: RwLock::new(None),
            custom_topics: RwLock::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            inbound_tx,
            connect_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
            transport,
            config,
        });
        Ok((manager, inbound_rx))
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub async fn backoff_attempt(&self) -> u32 {
        self.backoff.lock().await.attempt()
    }

    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// `Closed` is terminal; later transitions are ignored.
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Connects, retrying with backoff while auto-reconnect is enabled.
    ///
    /// Returns `false` when reconnection is disabled and the first attempt
    /// fails, or when the manager is shut down while waiting.
    pub async fn connect(self: &Arc<Self>) -> bool {
        self.ensure_supervisor().await;
        self.connect_with_backoff().await
    }

    async fn ensure_supervisor(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            return;
        }
        if let Some(events) = self.events_rx.lock().await.take() {
            *supervisor = Some(tokio::spawn(self.clone().supervise(events)));
        }
    }

    async fn connect_with_backoff(&self) -> bool {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return true;
        }

        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            self.set_state(ConnectionState::Connecting);

            match self.connect_once().await {
                Ok(()) => {
                    self.backoff.lock().await.reset();
                    self.after_connect().await;
                    return true;
                }
                Err(ConnectError::ShuttingDown) => return false,
                Err(e) => {
                    warn!("Connect attempt failed: {e}");
                    if !self.config.connection.auto_reconnect {
                        self.set_state(ConnectionState::Disconnected);
                        return false;
                    }

                    let (wait, attempt) = {
                        let mut backoff = self.backoff.lock().await;
                        let wait = backoff.advance(&mut rand::thread_rng());
                        (wait, backoff.attempt())
                    };
                    info!("Retrying in {wait:?} (attempt {attempt})");
                    self.set_state(ConnectionState::Reconnecting);

                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.shutdown.cancelled() => return false,
                    }
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<(), ConnectError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectError::ShuttingDown);
        }

        let (broker, secret) = self.resolve_broker().await?;
        let credentials = device_credentials(&self.config.identity, secret.as_deref(), Utc::now())?;
        let options = self.connect_options(broker, credentials);

        let session_id = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let events = EventSink::new(session_id, self.events_tx.clone());
        let session = self.transport.connect(&options, events).await?;

        if let Err(e) = self.subscribe_all(session.as_ref()).await {
            close_session(session.as_ref(), "half-open").await;
            return Err(e.into());
        }

        {
            // disconnect() cancels before it takes this lock
            let mut current = self.session.write().await;
            if !self.shutdown.is_cancelled() {
                self.current_session.store(session_id, Ordering::SeqCst);
                *current = Some(session);
                self.set_state(ConnectionState::Connected);
                info!("Session {session_id} established for {}", self.device_id());
                return Ok(());
            }
        }
        info!("Disconnected while session {session_id} was opening, closing it");
        close_session(session.as_ref(), "abandoned").await;
        Err(ConnectError::ShuttingDown)
    }

    async fn subscribe_all(&self, session: &dyn TransportSession) -> Result<(), TransportError> {
        let device_id = self.device_id();
        for suffix in DEVICE_SUBSCRIPTIONS {
            session.subscribe(&device_topic(device_id, suffix), self.qos).await?;
        }
        for topic in self.custom_topics.read().await.iter() {
            session.subscribe(topic, self.qos).await?;
        }
        Ok(())
    }

    async fn after_connect(&self) {
        let pending = self.buffer.lock().await.drain();
        if !pending.is_empty() {
            info!("Draining {} buffered message(s)", pending.len());
        }
        for message in pending {
            if !self.send(&message.topic, message.qos, message.payload).await {
                warn!("Buffered message to {} failed on resend", message.topic);
            }
        }

        if let Some(listener) = &self.listener {
            listener.on_connected();
        }
    }

    /// Broker to dial and, after provisioning, the secret to derive the password from.
    async fn resolve_broker(&self) -> Result<(BrokerAddress, Option<String>), ConnectError> {
        let conn = &self.config.connection;
        if !conn.provisioning.enabled {
            let broker = BrokerAddress::parse(&conn.server)
                .map_err(|e| HandshakeError::InvalidAddress(e.to_string()))?;
            return Ok((broker, None));
        }

        let cached = self.server_record.read().await.clone();
        let record = match cached {
            Some(record) => record,
            None => match self.records.load().await {
                Some(record) => {
                    info!("Using cached server record {}", record.server_uri);
                    record
                }
                None => self.run_provisioning().await?,
            },
        };
        *self.server_record.write().await = Some(record.clone());

        let broker = BrokerAddress::parse(&record.server_uri)
            .map_err(|e| HandshakeError::InvalidAddress(e.to_string()))?;
        let secret = Some(record.secret).filter(|s| !s.is_empty());
        Ok((broker, secret))
    }

    async fn run_provisioning(&self) -> Result<ServerRecord, HandshakeError> {
        let conn = &self.config.connection;
        let address = if conn.provisioning.server.is_empty() {
            &conn.server
        } else {
            &conn.provisioning.server
        };
        let broker =
            BrokerAddress::parse(address).map_err(|e| HandshakeError::InvalidAddress(e.to_string()))?;
        let credentials = provisioning_credentials(&self.config.identity, Utc::now())?;
        let options = self.connect_options(broker, credentials);
        let request = ProvisioningRequest {
            base_strategy_keyword: conn.provisioning.base_strategy_keyword.clone(),
        };

        info!("Provisioning device {}", self.device_id());
        let record = provision(
            self.transport.as_ref(),
            &options,
            self.device_id(),
            &request,
            PROVISIONING_TIMEOUT,
        )
        .await?;

        if let Err(e) = self.records.save(&record).await {
            warn!("Failed to persist server record: {e}");
        }
        Ok(record)
    }

    fn connect_options(&self, broker: BrokerAddress, credentials: Credentials) -> ConnectOptions {
        let conn = &self.config.connection;
        ConnectOptions {
            broker,
            client_id: credentials.client_id,
            username: credentials.username,
            password: credentials.password,
            keep_alive: conn.keep_alive(),
            connect_timeout: conn.connect_timeout(),
            operation_timeout: conn.operation_timeout(),
            inflight: conn.inflight_messages,
            tls: self.tls.clone(),
        }
    }

    async fn supervise(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::Message { topic, payload, .. } => {
                    if let Err(e) = self.inbound_tx.try_send(InboundMessage { topic, payload }) {
                        warn!("Inbound queue unavailable, dropping message: {e}");
                    }
                }
                TransportEvent::ConnectionLost { session, reason } => {
                    if session != self.current_session.load(Ordering::SeqCst) {
                        debug!("Ignoring loss of replaced session {session}");
                        continue;
                    }
                    self.handle_connection_lost(reason).await;
                }
            }
        }
        debug!("Connection supervisor stopped");
    }

    async fn handle_connection_lost(&self, reason: String) {
        warn!("Connection lost: {reason}");
        self.session.write().await.take();
        self.set_state(ConnectionState::Disconnected);

        if let Some(listener) = &self.listener {
            listener.on_connection_lost(&reason);
        }
        if self.config.connection.auto_reconnect && !self.shutdown.is_cancelled() {
            self.connect_with_backoff().await;
        }
    }

    /// Publishes now, or buffers while disconnected. Returns `true` only when sent;
    /// a buffered message returns `false` and is resent after the next connect.
    pub async fn send(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> bool {
        self.send_within(topic, qos, payload, self.config.connection.operation_timeout())
            .await
    }

    /// Like [`send`](Self::send) with an explicit acknowledgement timeout.
    pub async fn send_within(
        &self,
        topic: &str,
        qos: QoS,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> bool {
        let session = self.session.read().await.clone();
        let session = match session {
            Some(session) if self.is_connected() => session,
            _ => {
                self.buffer_message(topic, qos, payload).await;
                return false;
            }
        };

        match tokio::time::timeout(timeout, session.publish(topic, qos, payload)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!("Publish to {topic} failed: {e}");
                false
            }
            Err(_) => {
                warn!("Publish to {topic} timed out after {timeout:?}");
                false
            }
        }
    }

    async fn buffer_message(&self, topic: &str, qos: QoS, payload: Vec<u8>) {
        let mut buffer = self.buffer.lock().await;
        if !buffer.is_enabled() {
            debug!("Not connected, dropping publish to {topic}");
            return;
        }
        let evicted = buffer.push(BufferedMessage {
            topic: topic.to_string(),
            qos,
            payload,
        });
        if let Some(old) = evicted {
            warn!("Offline buffer full, evicted message for {}", old.topic);
        }
        debug!("Buffered publish to {topic} ({} pending)", buffer.len());
    }

    /// Subscribes to an application topic now and after every reconnect.
    pub async fn subscribe_topic(&self, topic: &str) -> bool {
        {
            let mut topics = self.custom_topics.write().await;
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
        }
        let session = self.session.read().await.clone();
        match session {
            Some(session) if self.is_connected() => match session.subscribe(topic, self.qos).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Subscribe to {topic} failed: {e}");
                    false
                }
            },
            _ => {
                debug!("Not connected, {topic} will be subscribed on connect");
                false
            }
        }
    }

    /// Tears down the session and stops reconnecting. The manager cannot be reused.
    pub async fn disconnect(&self) -> bool {
        self.shutdown.cancel();
        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.abort();
        }
        let session = self.session.write().await.take();
        self.set_state(ConnectionState::Closed);

        match session {
            Some(session) => match session.disconnect().await {
                Ok(()) => {
                    info!("Disconnected {}", self.device_id());
                    true
                }
                Err(e) => {
                    warn!("Disconnect failed: {e}");
                    false
                }
            },
            None => true,
        }
    }
}

#[async_trait]
impl Publisher for ConnectionManager {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> bool {
        self.send(topic, qos, payload).await
    }

    async fn subscribe(&self, topic: &str) -> bool {
        self.subscribe_topic(topic).await
    }

    fn device_id(&self) -> &str {
        &self.config.identity.device_id
    }

    fn default_qos(&self) -> QoS {
        self.qos
    }
}

async fn close_session(session: &dyn TransportSession, what: &str) {
    if let Err(e) = session.disconnect().await {
        debug!("Closing {what} session failed: {e}");
    }
}

fn load_tls(config: &DeviceConfig) -> Result<Option<Arc<TlsMaterial>>, ConfigError> {
    let conn = &config.connection;
    let operational_tls = BrokerAddress::parse(&conn.server)?.tls;
    let provisioning_tls = conn.provisioning.enabled;
    if !operational_tls && !provisioning_tls {
        return Ok(None);
    }

    let ca_path = conn
        .server_ca_path
        .as_deref()
        .ok_or(ConfigError::MissingTrustRoot)?;
    let identity = &config.identity;
    let client_identity = if identity.uses_client_certificate() {
        match (identity.cert_path.as_deref(), identity.key_path.as_deref()) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => return Err(ConfigError::MissingCertificate),
        }
    } else {
        None
    };
    TlsMaterial::load(ca_path, client_identity).map(|m| Some(Arc::new(m)))
}
