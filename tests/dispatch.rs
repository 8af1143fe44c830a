mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{device_config, eventually, topic, ScriptedTransport};
use devicelink::protocol::model::{
    Command, CommandOutcome, FileUrlRequest, PropertiesSetRequest, UpgradeInfo, UpgradeProgress,
    VersionReport,
};
use devicelink::protocol::{FileAction, OtaHandler, UpgradeKind};
use devicelink::{DeviceHandlers, IotDevice};
use rumqttc::QoS;
use serde_json::json;

async fn online(handlers: DeviceHandlers) -> (IotDevice, ScriptedTransport) {
    let transport = ScriptedTransport::new();
    let device =
        IotDevice::with_transport(device_config(), Arc::new(transport.clone()), handlers).unwrap();
    assert!(device.connect().await);
    (device, transport)
}

#[tokio::test]
async fn test_command_response_correlates_request_id() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let handlers = DeviceHandlers::new().with_command_handler(move |command: &Command| {
        log.lock().unwrap().push(command.command_name.clone());
        CommandOutcome::success(json!({"done": true}))
    });
    let (_device, transport) = online(handlers).await;

    transport
        .inject(
            &topic("sys/commands/request_id=42"),
            json!({"service_id": "smoke", "command_name": "reset", "paras": {}}),
        )
        .await;

    let response_topic = topic("sys/commands/response/request_id=42");
    assert!(eventually(|| !transport.published_on("request_id=42").is_empty()).await);
    let responses = transport.published_on("request_id=42");
    assert_eq!(responses[0].topic, response_topic);
    assert_eq!(responses[0].qos, QoS::AtLeastOnce);
    assert_eq!(responses[0].json()["result_code"], 0);
    assert_eq!(responses[0].json()["paras"]["done"], true);
    assert_eq!(*seen.lock().unwrap(), vec!["reset".to_string()]);
}

#[tokio::test]
async fn test_properties_set_answers_with_combined_result() {
    let handlers = DeviceHandlers::new()
        .with_properties_set_handler(|_: &PropertiesSetRequest| true)
        .with_properties_set_handler(|_: &PropertiesSetRequest| false);
    let (_device, transport) = online(handlers).await;

    transport
        .inject(
            &topic("sys/properties/set/request_id=7"),
            json!({"services": [{"service_id": "smoke", "properties": {"alarm": 1}}]}),
        )
        .await;

    assert!(eventually(|| !transport.published_on("request_id=7").is_empty()).await);
    let response = &transport.published_on("request_id=7")[0];
    assert_eq!(response.topic, topic("sys/properties/set/response/request_id=7"));
    assert_eq!(response.json()["result_code"], 1);
}

#[tokio::test]
async fn test_malformed_payload_gets_no_response() {
    let handlers = DeviceHandlers::new()
        .with_command_handler(|_: &Command| CommandOutcome::success(json!({})));
    let (_device, transport) = online(handlers).await;

    transport
        .inject(&topic("sys/commands/request_id=9"), json!("not an object"))
        .await;
    common::settle().await;
    assert!(transport.published_on("request_id=9").is_empty());
}

#[tokio::test]
async fn test_file_url_reaches_waiting_caller() {
    let (device, transport) = online(DeviceHandlers::new()).await;

    let request = FileUrlRequest {
        file_name: "boot.log".into(),
        file_attributes: Some(json!({"size": 12})),
    };
    assert!(device.request_upload_url(request).await);
    let sent = transport.published_on("sys/events/up");
    assert_eq!(sent[0].json()["services"][0]["event_type"], "get_upload_url");

    transport
        .inject(
            &topic("sys/events/down"),
            json!({"services": [{
                "service_id": "$file_manager",
                "event_type": "get_upload_url_response",
                "event_time": "20240101T000000Z",
                "paras": {"url": "https://obs/boot.log", "object_name": "boot.log", "expire": 3600}
            }]}),
        )
        .await;

    let url = device
        .wait_file_url("boot.log", FileAction::Upload, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(url.url, "https://obs/boot.log");
    assert!(device
        .wait_file_url("boot.log", FileAction::Download, Duration::from_millis(200))
        .await
        .is_none());
}

struct FixedOta;

impl OtaHandler for FixedOta {
    fn current_version(&self) -> VersionReport {
        VersionReport {
            sw_version: "1.0".into(),
            fw_version: "2.0".into(),
        }
    }

    fn on_upgrade(&self, _kind: UpgradeKind, info: &UpgradeInfo) -> UpgradeProgress {
        UpgradeProgress {
            result_code: 0,
            progress: 100,
            version: info.version.clone(),
            description: "success".into(),
        }
    }
}

#[tokio::test]
async fn test_ota_events_report_back() {
    let (_device, transport) = online(DeviceHandlers::new().with_ota_handler(FixedOta)).await;

    transport
        .inject(
            &topic("sys/events/down"),
            json!({"services": [
                {"service_id": "$ota", "event_type": "version_query", "paras": {}},
                {"service_id": "$ota", "event_type": "firmware_upgrade",
                 "paras": {"version": "2.1", "url": "https://x/fw.bin", "file_size": 10}}
            ]}),
        )
        .await;

    assert!(eventually(|| transport.published_on("sys/events/up").len() == 2).await);
    let reports: Vec<_> = transport
        .published_on("sys/events/up")
        .iter()
        .map(|p| p.json())
        .collect();
    assert_eq!(reports[0]["object_device_id"], common::DEVICE_ID);
    assert_eq!(reports[0]["services"][0]["event_type"], "version_report");
    assert_eq!(reports[0]["services"][0]["paras"]["fw_version"], "2.0");
    assert_eq!(reports[1]["services"][0]["event_type"], "upgrade_progress_report");
    assert_eq!(reports[1]["services"][0]["paras"]["version"], "2.1");
}

#[tokio::test]
async fn test_custom_topic_handler_receives_payload() {
    let (device, transport) = online(DeviceHandlers::new()).await;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    device
        .subscribe_custom_topic("$oc/devices/dev-1/user/+", move |topic: &str, payload: &[u8]| {
            sink.lock().unwrap().push((topic.to_string(), payload.to_vec()));
        })
        .await;

    transport
        .inject("$oc/devices/dev-1/user/alarms", json!({"level": 3}))
        .await;
    assert!(eventually(|| received.lock().unwrap().len() == 1).await);
    assert_eq!(received.lock().unwrap()[0].0, "$oc/devices/dev-1/user/alarms");
}

#[tokio::test]
async fn test_exact_custom_topic_takes_priority_over_wildcard() {
    let (device, transport) = online(DeviceHandlers::new()).await;
    let exact = Arc::new(Mutex::new(Vec::new()));
    let wildcard = Arc::new(Mutex::new(Vec::new()));

    let sink = wildcard.clone();
    device
        .subscribe_custom_topic("$oc/devices/dev-1/user/#", move |topic: &str, _: &[u8]| {
            sink.lock().unwrap().push(topic.to_string());
        })
        .await;
    let sink = exact.clone();
    device
        .subscribe_custom_topic("$oc/devices/dev-1/user/alarms", move |_: &str, payload: &[u8]| {
            sink.lock().unwrap().push(payload.to_vec());
        })
        .await;

    transport
        .inject("$oc/devices/dev-1/user/alarms", json!({"level": 3}))
        .await;
    transport
        .inject("$oc/devices/dev-1/user/meter/1", json!({"kwh": 2}))
        .await;

    assert!(eventually(|| exact.lock().unwrap().len() == 1 && wildcard.lock().unwrap().len() == 1).await);
    assert_eq!(exact.lock().unwrap()[0], serde_json::to_vec(&json!({"level": 3})).unwrap());
    assert_eq!(*wildcard.lock().unwrap(), vec!["$oc/devices/dev-1/user/meter/1".to_string()]);
    assert!(transport
        .subscribed()
        .contains(&"$oc/devices/dev-1/user/alarms".to_string()));
}

#[tokio::test]
async fn test_gateway_status_updates_are_batched() {
    let mut config = device_config();
    config.connection.sub_device_batch_size = 2;
    let transport = ScriptedTransport::new();
    let device =
        IotDevice::with_transport(config, Arc::new(transport.clone()), DeviceHandlers::new()).unwrap();
    assert!(device.connect().await);

    let statuses: Vec<_> = (0..5)
        .map(|i| devicelink::protocol::model::DeviceStatus {
            device_id: format!("child-{i}"),
            status: "ONLINE".into(),
        })
        .collect();
    assert!(device.update_sub_device_states(&statuses).await);

    let sent = transport.published_on("sys/events/up");
    assert_eq!(sent.len(), 3);
    let last = sent[2].json();
    assert_eq!(last["services"][0]["event_type"], "sub_device_update_status");
    assert_eq!(last["services"][0]["paras"]["device_statuses"][0]["device_id"], "child-4");
}

#[tokio::test]
async fn test_gateway_and_service_events_are_reported() {
    use devicelink::protocol::model::{DeviceInfo, DeviceService, FileTransferResult, ServiceProperty};

    let (device, transport) = online(DeviceHandlers::new()).await;

    let child = DeviceInfo {
        node_id: Some("node-9".into()),
        ..Default::default()
    };
    assert!(device.add_sub_devices(&[child]).await);
    assert!(device.delete_sub_devices(&["child-1".to_string()]).await);
    assert!(device.sync_sub_devices(Some(3)).await);
    assert!(device.report_device_info(Some("1.2.0"), None).await);
    assert!(device.request_time_sync().await);
    let outcome = FileTransferResult {
        object_name: "trace.bin".into(),
        result_code: 0,
        ..Default::default()
    };
    assert!(device.report_upload_result(&outcome).await);

    let events: Vec<_> = transport
        .published_on("sys/events/up")
        .iter()
        .map(|p| p.json()["services"][0].clone())
        .collect();
    let kinds: Vec<_> = events
        .iter()
        .map(|e| format!("{}/{}", e["service_id"].as_str().unwrap(), e["event_type"].as_str().unwrap()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            "$sub_device_manager/add_sub_device_request",
            "$sub_device_manager/delete_sub_device_request",
            "$sub_device_manager/sub_device_sync_request",
            "$sdk_info/sdk_info_report",
            "$time_sync/time_sync_request",
            "$file_manager/upload_result_report",
        ]
    );
    assert_eq!(events[0]["paras"]["devices"][0]["node_id"], "node-9");
    assert_eq!(events[1]["paras"]["devices"], json!(["child-1"]));
    assert_eq!(events[2]["paras"]["version"], 3);
    assert_eq!(events[3]["paras"]["sw_version"], "1.2.0");
    assert!(events[3]["paras"].get("fw_version").is_none());
    assert!(events[4]["paras"]["device_send_time"].as_i64().unwrap() > 0);
    assert_eq!(events[5]["paras"]["object_name"], "trace.bin");

    let children: Vec<_> = (0..3)
        .map(|i| DeviceService {
            device_id: format!("child-{i}"),
            services: vec![ServiceProperty {
                service_id: "meter".into(),
                properties: json!({"kwh": i}).as_object().unwrap().clone(),
                event_time: None,
            }],
        })
        .collect();
    assert!(device.batch_report_sub_device_properties(&children).await);
    let batches = transport.published_on("sys/gateway/sub_devices/properties/report");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].json()["devices"][2]["device_id"], "child-2");
}
