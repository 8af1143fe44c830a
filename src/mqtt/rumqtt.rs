use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::{ConnectOptions, EventSink, Transport, TransportSession};
use crate::error::TransportError;

const REQUEST_CHANNEL_CAPACITY: usize = 128;
const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// [`Transport`] backed by rumqttc
#[derive(Clone, Copy, Debug, Default)]
pub struct RumqttTransport;

impl RumqttTransport {
    fn mqtt_options(options: &ConnectOptions) -> Result<MqttOptions, TransportError> {
        let mut mqtt_options = MqttOptions::new(
            options.client_id.clone(),
            options.broker.host.clone(),
            options.broker.port,
        );
        mqtt_options
            .set_credentials(
                options.username.clone(),
                options.password.clone().unwrap_or_default(),
            )
            .set_keep_alive(options.keep_alive)
            .set_clean_session(true)
            .set_inflight(options.inflight)
            .set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        if options.broker.tls {
            let material = options
                .tls
                .as_ref()
                .ok_or_else(|| TransportError::Tls("TLS broker without trust root".into()))?;
            let client_config = material.client_config()?;
            mqtt_options.set_transport(rumqttc::Transport::tls_with_config(
                TlsConfiguration::Rustls(Arc::new(client_config)),
            ));
        }
        Ok(mqtt_options)
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(TransportError::Refused(format!("{code:?}"))),
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(TransportError::Connect(e.to_string())),
        }
    }
}

#[async_trait]
impl Transport for RumqttTransport {
    async fn connect(
        &self,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let mqtt_options = Self::mqtt_options(options)?;
        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        tokio::time::timeout(options.connect_timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| TransportError::Timeout(options.connect_timeout))??;
        info!(
            "Connected to {}:{} as {}",
            options.broker.host, options.broker.port, options.client_id
        );

        let connected = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(pump_events(
            eventloop,
            events,
            connected.clone(),
            closing.clone(),
        ));

        Ok(Arc::new(RumqttSession {
            client,
            connected,
            closing,
            pump,
            operation_timeout: options.operation_timeout,
        }))
    }
}

async fn pump_events(
    mut eventloop: EventLoop,
    events: EventSink,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                events
                    .message(publish.topic, publish.payload.to_vec())
                    .await;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Session {} disconnecting", events.session());
                connected.store(false, Ordering::SeqCst);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                if !closing.load(Ordering::SeqCst) {
                    warn!("Session {} lost: {}", events.session(), e);
                    events.connection_lost(e.to_string()).await;
                }
                break;
            }
        }
    }
}

struct RumqttSession {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    pump: JoinHandle<()>,
    operation_timeout: Duration,
}

#[async_trait]
impl TransportSession for RumqttSession {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        tokio::time::timeout(
            self.operation_timeout,
            self.client.publish(topic, qos, false, payload),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.operation_timeout))?
        .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        tokio::time::timeout(self.operation_timeout, self.client.subscribe(topic, qos))
            .await
            .map_err(|_| TransportError::Timeout(self.operation_timeout))?
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::SeqCst);
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()));
        self.connected.store(false, Ordering::SeqCst);
        result
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.pump.is_finished()
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
