#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{Router, extract::State, routing::post};
use serde_json::json;

use application::manager::DeviceManager;
use application::RuntimeSettings;
use domain::device::DeviceStatus;
use domain::model::DeviceModel;
use infrastructure::config::SinkConfig;
use infrastructure::{MetricsSink, ModelStore};

pub type Bodies = Arc<Mutex<Vec<serde_json::Value>>>;

async fn capture_telemetry(State(bodies): State<Bodies>, body: String) -> &'static str {
    if let Ok(value) = serde_json::from_str(&body) {
        bodies.lock().unwrap().push(value);
    }
    "ok"
}

/// Local HTTP listener standing in for an external telemetry endpoint.
pub async fn start_ingest() -> (Bodies, u16) {
    let bodies: Bodies = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/telemetry", post(capture_telemetry))
        .with_state(bodies.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (bodies, port)
}

/// A port nothing listens on.
pub async fn dead_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

pub fn http_sensor_model(id: &str, port: u16, interval_ms: u64) -> DeviceModel {
    serde_json::from_value(json!({
        "id": id,
        "type": "sensor",
        "protocol": "http",
        "connection": {"host": "127.0.0.1", "port": port, "basePath": "/telemetry"},
        "telemetry": [{
            "name": "temperature",
            "type": "number",
            "unit": "C",
            "intervalMs": interval_ms,
            "generator": {"type": "random", "min": 20.0, "max": 30.0, "distribution": "uniform"}
        }]
    }))
    .unwrap()
}

pub fn proxy_model(id: &str) -> DeviceModel {
    serde_json::from_value(json!({
        "id": id,
        "type": "proxy",
        "protocol": "http",
        "telemetry": []
    }))
    .unwrap()
}

pub struct TestEngine {
    pub manager: Arc<DeviceManager>,
    pub sink: Arc<MetricsSink>,
    _model_dir: tempfile::TempDir,
}

pub fn engine() -> TestEngine {
    let model_dir = tempfile::tempdir().unwrap();
    let sink = MetricsSink::start(SinkConfig {
        url: None,
        flush_interval_ms: 3_600_000,
        ..SinkConfig::default()
    });
    let settings = RuntimeSettings {
        connect_timeout: Duration::from_secs(2),
        publish_timeout: Duration::from_secs(1),
        queue_capacity: 64,
        graceful_stop: Duration::from_secs(2),
        default_broker_host: "localhost".to_string(),
    };
    let manager = DeviceManager::new(
        ModelStore::new(model_dir.path()),
        sink.clone(),
        settings,
        10_000,
    );
    TestEngine {
        manager,
        sink,
        _model_dir: model_dir,
    }
}

/// Polls until the device reaches the wanted status or the deadline hits.
pub async fn wait_status(
    manager: &Arc<DeviceManager>,
    device_id: &str,
    wanted: DeviceStatus,
    deadline: Duration,
) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if let Ok(device) = manager.get_device(device_id).await {
            if device.status == wanted {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
