use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{Router, extract::State, routing::post};

use domain::device::Source;
use domain::metrics::Point;
use infrastructure::MetricsSink;
use infrastructure::config::SinkConfig;

type Captured = Arc<Mutex<Vec<String>>>;

async fn capture(State(store): State<Captured>, body: String) -> &'static str {
    store.lock().unwrap().push(body);
    "ok"
}

async fn start_capture_server() -> (Captured, String) {
    let store: Captured = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/write", post(capture))
        .with_state(store.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (store, format!("http://{addr}/write"))
}

fn config(url: String) -> SinkConfig {
    SinkConfig {
        url: Some(url),
        token: None,
        batch_size: 1_000,
        buffer_capacity: 10_000,
        flush_interval_ms: 50,
        shutdown_flush_ms: 2_000,
    }
}

#[tokio::test]
async fn test_points_arrive_as_line_protocol() {
    let (store, url) = start_capture_server().await;
    let sink = MetricsSink::start(config(url));

    sink.submit(Point::telemetry("t1-0", "t1", Some("G"), Source::Simulated).field("temperature", 21.5));
    sink.submit(Point::telemetry("p-0", "p1", None, Source::Physical).field("humidity", 60i64));

    tokio::time::sleep(Duration::from_millis(300)).await;
    sink.shutdown().await;

    let bodies = store.lock().unwrap().join("\n");
    assert!(
        bodies.contains("telemetry,deviceId=t1-0,modelId=t1,groupId=G,source=simulated temperature=21.5"),
        "missing simulated point in: {bodies}"
    );
    assert!(
        bodies.contains("telemetry,deviceId=p-0,modelId=p1,source=physical humidity=60i"),
        "missing physical point in: {bodies}"
    );
    assert_eq!(sink.points_written(), 2);
}

#[tokio::test]
async fn test_full_batch_flushes_before_interval() {
    let (store, url) = start_capture_server().await;
    let sink = MetricsSink::start(SinkConfig {
        batch_size: 5,
        flush_interval_ms: 3_600_000, // interval never fires during the test
        ..config(url)
    });

    for i in 0..5 {
        sink.submit(Point::new("engine_stats").field("activeDevices", i as i64));
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.lock().unwrap().len(), 1, "batch-full should trigger a flush");
    sink.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_flushes_pending_points() {
    let (store, url) = start_capture_server().await;
    let sink = MetricsSink::start(SinkConfig {
        flush_interval_ms: 3_600_000,
        ..config(url)
    });

    for _ in 0..3 {
        sink.submit(Point::new("telemetry").tag("deviceId", "d").field("x", 1.0));
    }
    sink.shutdown().await;

    let bodies = store.lock().unwrap().join("\n");
    assert_eq!(bodies.lines().count(), 3);
    assert_eq!(sink.pending(), 0);
}

#[tokio::test]
async fn test_every_emitted_point_carries_source_tag() {
    let (store, url) = start_capture_server().await;
    let sink = MetricsSink::start(config(url));

    sink.submit(Point::telemetry("a", "m", None, Source::Simulated).field("v", 1.0));
    sink.submit(Point::device_event(
        "a",
        "m",
        None,
        Source::Simulated,
        domain::LifecycleEvent::Started,
    ));
    sink.submit(Point::connection(
        "a",
        domain::Protocol::Mqtt,
        Source::Simulated,
        true,
        3.0,
    ));
    sink.shutdown().await;

    let bodies = store.lock().unwrap().join("\n");
    for line in bodies.lines() {
        assert!(
            line.contains("source=simulated") || line.contains("source=physical"),
            "point without source tag: {line}"
        );
    }
}
