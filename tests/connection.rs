mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{device_config, eventually, topic, ScriptedTransport};
use devicelink::mqtt::{ConnectionListener, ConnectionState};
use devicelink::protocol::model::DeviceMessage;
use devicelink::{DeviceHandlers, IotDevice};
use serde_json::json;

#[derive(Default)]
struct Counts {
    connected: AtomicUsize,
    lost: AtomicUsize,
}

#[derive(Clone, Default)]
struct CountingListener(Arc<Counts>);

impl ConnectionListener for CountingListener {
    fn on_connected(&self) {
        self.0.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn on_connection_lost(&self, _reason: &str) {
        self.0.lost.fetch_add(1, Ordering::SeqCst);
    }
}

fn message(content: &str) -> DeviceMessage {
    DeviceMessage {
        content: json!(content),
        ..DeviceMessage::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_until_broker_accepts() {
    let transport = ScriptedTransport::new();
    transport.fail_next(2);
    let device =
        IotDevice::with_transport(device_config(), Arc::new(transport.clone()), DeviceHandlers::new())
            .unwrap();

    assert!(device.connect().await);
    assert!(device.is_connected());
    assert_eq!(transport.connects(), 3);
    assert_eq!(device.connection().backoff_attempt().await, 0);

    let subscribed = transport.subscribed();
    assert!(subscribed.contains(&topic("sys/commands/#")));
    assert!(subscribed.contains(&topic("sys/events/down")));
    assert_eq!(subscribed.len(), 6);
}

#[tokio::test]
async fn test_first_failure_is_final_without_auto_reconnect() {
    let transport = ScriptedTransport::new();
    transport.fail_next(1);
    let mut config = device_config();
    config.connection.auto_reconnect = false;
    let device =
        IotDevice::with_transport(config, Arc::new(transport.clone()), DeviceHandlers::new()).unwrap();

    assert!(!device.connect().await);
    assert_eq!(transport.connects(), 1);
}

#[tokio::test]
async fn test_client_id_carries_hour_stamp() {
    let transport = ScriptedTransport::new();
    let device =
        IotDevice::with_transport(device_config(), Arc::new(transport.clone()), DeviceHandlers::new())
            .unwrap();
    assert!(device.connect().await);

    let options = transport.last_options().unwrap();
    assert_eq!(options.username, common::DEVICE_ID);
    assert!(options.client_id.starts_with("dev-1_0_0_"));
    assert_eq!(options.client_id.len(), "dev-1_0_0_".len() + 10);
    assert_eq!(options.password.unwrap().len(), 64);
}

#[tokio::test(start_paused = true)]
async fn test_buffered_publishes_drain_once_after_reconnect() {
    let transport = ScriptedTransport::new();
    let listener = CountingListener::default();
    let mut config = device_config();
    config.connection.offline_buffer_capacity = 8;
    let handlers = DeviceHandlers::new().with_connection_listener(listener.clone());
    let device = IotDevice::with_transport(config, Arc::new(transport.clone()), handlers).unwrap();
    assert!(device.connect().await);

    transport.fail_next(1);
    transport.drop_session().await;
    assert!(eventually(|| !device.is_connected()).await);
    assert_eq!(listener.0.lost.load(Ordering::SeqCst), 1);

    assert!(!device.send_message(&message("first")).await);
    assert!(!device.send_message(&message("second")).await);
    assert_eq!(device.connection().buffered().await, 2);

    assert!(eventually(|| listener.0.connected.load(Ordering::SeqCst) == 2).await);
    let sent = transport.published_on("sys/messages/up");
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].json()["content"], "first");
    assert_eq!(sent[1].json()["content"], "second");
    assert_eq!(device.connection().buffered().await, 0);

    transport.drop_session().await;
    assert!(eventually(|| listener.0.connected.load(Ordering::SeqCst) == 3).await);
    assert_eq!(transport.published_on("sys/messages/up").len(), 2);
}

#[tokio::test]
async fn test_publish_without_buffer_is_dropped() {
    let transport = ScriptedTransport::new();
    let device =
        IotDevice::with_transport(device_config(), Arc::new(transport.clone()), DeviceHandlers::new())
            .unwrap();

    assert!(!device.send_message(&message("lost")).await);
    assert_eq!(device.connection().buffered().await, 0);
    assert!(device.connect().await);
    assert!(transport.published_on("sys/messages/up").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_custom_topic_resubscribed_after_reconnect() {
    let transport = ScriptedTransport::new();
    let device =
        IotDevice::with_transport(device_config(), Arc::new(transport.clone()), DeviceHandlers::new())
            .unwrap();
    assert!(device.connect().await);

    let custom = "$oc/devices/dev-1/user/alarms";
    assert!(device.subscribe_custom_topic(custom, |_: &str, _: &[u8]| {}).await);

    transport.drop_session().await;
    assert!(eventually(|| transport.connects() == 2 && device.is_connected()).await);
    let count = transport
        .subscribed()
        .iter()
        .filter(|t| t.as_str() == custom)
        .count();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_disconnect_is_terminal() {
    let transport = ScriptedTransport::new();
    let device =
        IotDevice::with_transport(device_config(), Arc::new(transport.clone()), DeviceHandlers::new())
            .unwrap();
    assert!(device.connect().await);
    assert!(device.disconnect().await);
    assert!(!device.is_connected());
    assert!(!device.connect().await);
    assert_eq!(transport.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_connecting_closes_the_late_session() {
    let transport = ScriptedTransport::new();
    transport.delay_connects(Duration::from_millis(200));
    let device = Arc::new(
        IotDevice::with_transport(device_config(), Arc::new(transport.clone()), DeviceHandlers::new())
            .unwrap(),
    );

    let connecting = tokio::spawn({
        let device = device.clone();
        async move { device.connect().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(device.disconnect().await);

    assert!(!connecting.await.unwrap());
    assert!(!device.is_connected());
    assert_eq!(*device.connection().state().borrow(), ConnectionState::Closed);
    assert_eq!(transport.connects(), 1);
    assert_eq!(transport.disconnects(), 1);
}
