mod common;

use std::time::Duration;

use common::*;
use domain::device::DeviceStatus;
use domain::error::EngineError;
use domain::group::{DropoutConfig, DropoutStrategy, LaunchConfig, LaunchStrategy};

fn launch(strategy: LaunchStrategy, delay_ms: u64) -> LaunchConfig {
    LaunchConfig {
        strategy,
        delay_ms: Some(delay_ms),
        ..LaunchConfig::default()
    }
}

async fn wait_all_running(engine: &TestEngine, ids: &[String], deadline: Duration) {
    for id in ids {
        assert!(
            wait_status(&engine.manager, id, DeviceStatus::Running, deadline).await,
            "{id} did not reach running"
        );
    }
}

fn member_ids(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("{prefix}-{i}")).collect()
}

async fn started_at(engine: &TestEngine, id: &str) -> chrono::DateTime<chrono::Utc> {
    engine
        .manager
        .get_device(id)
        .await
        .unwrap()
        .started_at
        .unwrap()
}

#[tokio::test]
async fn test_group_creation_materializes_members() {
    let engine = engine();
    engine
        .manager
        .register_model(http_sensor_model("t1", 1234, 1000))
        .await
        .unwrap();
    let group = engine
        .manager
        .create_group("t1", 10, Some("G".to_string()), Some("x-{index}".to_string()))
        .await
        .unwrap();

    assert_eq!(group.member_count, 10);
    let device = engine.manager.get_device("x-0").await.unwrap();
    assert_eq!(device.group_id.as_deref(), Some("G"));
    assert_eq!(device.status, DeviceStatus::Created);
    assert!(engine.manager.get_device("x-9").await.is_ok());
}

#[tokio::test]
async fn test_group_count_zero_rejected() {
    let engine = engine();
    engine
        .manager
        .register_model(http_sensor_model("t1", 1234, 1000))
        .await
        .unwrap();
    let err = engine
        .manager
        .create_group("t1", 0, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_group_creation_rolls_back_on_collision() {
    let engine = engine();
    engine
        .manager
        .register_model(http_sensor_model("t1", 1234, 1000))
        .await
        .unwrap();
    // occupy one of the ids the pattern would produce
    engine
        .manager
        .create_device("t1", Some("x-2".to_string()), None)
        .await
        .unwrap();

    let err = engine
        .manager
        .create_group("t1", 5, Some("G".to_string()), Some("x-{index}".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists(_)));

    // nothing from the failed creation leaked into the catalog
    assert!(engine.manager.get_device("x-0").await.is_err());
    assert!(engine.manager.get_group("G").await.is_err());
    assert_eq!(engine.manager.stats().await.total_devices, 1);
}

#[tokio::test]
async fn test_immediate_launch_runs_everyone() {
    let (_bodies, port) = start_ingest().await;
    let engine = engine();
    engine
        .manager
        .register_model(http_sensor_model("t1", port, 500))
        .await
        .unwrap();
    engine
        .manager
        .create_group("t1", 10, Some("G".to_string()), Some("x-{index}".to_string()))
        .await
        .unwrap();

    let accepted = engine
        .manager
        .start_group("G", launch(LaunchStrategy::Immediate, 0))
        .await
        .unwrap();
    assert_eq!(accepted.accepted_count, 10);
    assert_eq!(accepted.estimated_duration_ms, 0);

    wait_all_running(&engine, &member_ids("x", 10), Duration::from_secs(3)).await;
    let stats = engine.manager.stats().await;
    assert_eq!(stats.running_devices, 10);

    let group = engine.manager.get_group("G").await.unwrap();
    assert_eq!(group.running_members, 10);

    engine.manager.stop_group("G").await.unwrap();
    assert_eq!(engine.manager.stats().await.running_devices, 0);
}

#[tokio::test]
async fn test_linear_launch_is_ordered_and_spaced() {
    let (_bodies, port) = start_ingest().await;
    let engine = engine();
    engine
        .manager
        .register_model(http_sensor_model("t1", port, 1_000))
        .await
        .unwrap();
    engine
        .manager
        .create_group("t1", 4, Some("G".to_string()), Some("x-{index}".to_string()))
        .await
        .unwrap();

    let accepted = engine
        .manager
        .start_group("G", launch(LaunchStrategy::Linear, 150))
        .await
        .unwrap();
    assert_eq!(accepted.accepted_count, 4);
    assert_eq!(accepted.estimated_duration_ms, 450);

    wait_all_running(&engine, &member_ids("x", 4), Duration::from_secs(5)).await;

    let mut starts = Vec::new();
    for id in member_ids("x", 4) {
        starts.push(
            engine
                .manager
                .get_device(&id)
                .await
                .unwrap()
                .started_at
                .unwrap(),
        );
    }
    // dispatch follows ascending device id with the configured spacing
    for pair in starts.windows(2) {
        assert!(pair[0] <= pair[1], "start order violated: {starts:?}");
    }
    let spread = (starts[3] - starts[0]).num_milliseconds();
    assert!(spread >= 300, "expected staged spread, got {spread}ms");

    engine.manager.stop_group("G").await.unwrap();
}

#[tokio::test]
async fn test_batch_launch_groups_dispatch() {
    let (_bodies, port) = start_ingest().await;
    let engine = engine();
    engine
        .manager
        .register_model(http_sensor_model("t1", port, 1_000))
        .await
        .unwrap();
    engine
        .manager
        .create_group("t1", 5, Some("G".to_string()), Some("x-{index}".to_string()))
        .await
        .unwrap();

    let config = LaunchConfig {
        strategy: LaunchStrategy::Batch,
        delay_ms: Some(250),
        batch_size: 2,
        ..LaunchConfig::default()
    };
    engine.manager.start_group("G", config).await.unwrap();
    wait_all_running(&engine, &member_ids("x", 5), Duration::from_secs(5)).await;

    let x0 = started_at(&engine, "x-0").await;
    let x1 = started_at(&engine, "x-1").await;
    let x4 = started_at(&engine, "x-4").await;

    let first_batch_gap = (x1 - x0).num_milliseconds().abs();
    assert!(first_batch_gap < 200, "same batch should start together, gap {first_batch_gap}ms");

    let cross_batch_gap = (x4 - x0).num_milliseconds();
    assert!(cross_batch_gap >= 350, "expected two delays between batches, got {cross_batch_gap}ms");

    engine.manager.stop_group("G").await.unwrap();
}

#[tokio::test]
async fn test_stop_group_cancels_pending_starts() {
    let (_bodies, port) = start_ingest().await;
    let engine = engine();
    engine
        .manager
        .register_model(http_sensor_model("t1", port, 1_000))
        .await
        .unwrap();
    engine
        .manager
        .create_group("t1", 10, Some("G".to_string()), Some("x-{index}".to_string()))
        .await
        .unwrap();

    engine
        .manager
        .start_group("G", launch(LaunchStrategy::Linear, 400))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    engine.manager.stop_group("G").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut created = 0;
    for id in member_ids("x", 10) {
        let device = engine.manager.get_device(&id).await.unwrap();
        assert!(
            !device.status.is_running(),
            "{id} still running after group stop"
        );
        if device.status == DeviceStatus::Created {
            created += 1;
        }
    }
    // the tail of the schedule never fired
    assert!(created >= 5, "expected unfired members, got {created} created");
}

#[tokio::test]
async fn test_dropout_with_reconnect_recovers() {
    let (_bodies, port) = start_ingest().await;
    let engine = engine();
    engine
        .manager
        .register_model(http_sensor_model("t1", port, 200))
        .await
        .unwrap();
    engine
        .manager
        .create_group("t1", 4, Some("G".to_string()), Some("x-{index}".to_string()))
        .await
        .unwrap();
    engine
        .manager
        .start_group("G", launch(LaunchStrategy::Immediate, 0))
        .await
        .unwrap();
    wait_all_running(&engine, &member_ids("x", 4), Duration::from_secs(3)).await;

    let accepted = engine
        .manager
        .dropout_group(
            "G",
            DropoutConfig {
                strategy: DropoutStrategy::Immediate,
                percentage: Some(50.0),
                reconnect: true,
                reconnect_delay_ms: 300,
                ..DropoutConfig::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(accepted.affected_count, 2);
    assert_eq!(accepted.estimated_duration_ms, 0);

    // deterministic selection: ascending device id
    assert!(
        wait_status(&engine.manager, "x-0", DeviceStatus::Reconnecting, Duration::from_secs(1))
            .await
            || engine.manager.get_device("x-0").await.unwrap().status == DeviceStatus::Running,
        "x-0 should have been severed"
    );

    // everyone is back within the reconnect window
    wait_all_running(&engine, &member_ids("x", 4), Duration::from_secs(4)).await;
    engine.manager.stop_group("G").await.unwrap();
}

#[tokio::test]
async fn test_dropout_without_reconnect_stops_victims() {
    let (_bodies, port) = start_ingest().await;
    let engine = engine();
    engine
        .manager
        .register_model(http_sensor_model("t1", port, 200))
        .await
        .unwrap();
    engine
        .manager
        .create_group("t1", 4, Some("G".to_string()), Some("x-{index}".to_string()))
        .await
        .unwrap();
    engine
        .manager
        .start_group("G", launch(LaunchStrategy::Immediate, 0))
        .await
        .unwrap();
    wait_all_running(&engine, &member_ids("x", 4), Duration::from_secs(3)).await;

    engine
        .manager
        .dropout_group(
            "G",
            DropoutConfig {
                strategy: DropoutStrategy::Immediate,
                count: Some(2),
                reconnect: false,
                ..DropoutConfig::default()
            },
        )
        .await
        .unwrap();

    // victims are the two lowest ids
    assert!(wait_status(&engine.manager, "x-0", DeviceStatus::Stopped, Duration::from_secs(2)).await);
    assert!(wait_status(&engine.manager, "x-1", DeviceStatus::Stopped, Duration::from_secs(2)).await);
    assert_eq!(
        engine.manager.get_device("x-2").await.unwrap().status,
        DeviceStatus::Running
    );
    assert_eq!(engine.manager.stats().await.running_devices, 2);

    engine.manager.stop_group("G").await.unwrap();
}

#[tokio::test]
async fn test_dropout_requires_selection() {
    let engine = engine();
    engine
        .manager
        .register_model(http_sensor_model("t1", 1234, 1000))
        .await
        .unwrap();
    engine
        .manager
        .create_group("t1", 2, Some("G".to_string()), None)
        .await
        .unwrap();

    let err = engine
        .manager
        .dropout_group("G", DropoutConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_proxy_group_launch_skips_everyone() {
    let engine = engine();
    engine
        .manager
        .register_model(proxy_model("p1"))
        .await
        .unwrap();
    engine
        .manager
        .create_group("p1", 3, Some("P".to_string()), None)
        .await
        .unwrap();

    let accepted = engine
        .manager
        .start_group("P", launch(LaunchStrategy::Immediate, 0))
        .await
        .unwrap();
    assert_eq!(accepted.accepted_count, 0);
    assert_eq!(engine.manager.stats().await.running_devices, 0);
}

#[tokio::test]
async fn test_delete_group_removes_members() {
    let engine = engine();
    engine
        .manager
        .register_model(http_sensor_model("t1", 1234, 1000))
        .await
        .unwrap();
    engine
        .manager
        .create_group("t1", 3, Some("G".to_string()), Some("x-{index}".to_string()))
        .await
        .unwrap();
    assert_eq!(engine.manager.stats().await.total_devices, 3);

    engine.manager.delete_group("G").await.unwrap();

    assert!(engine.manager.get_group("G").await.is_err());
    assert!(engine.manager.get_device("x-0").await.is_err());
    let stats = engine.manager.stats().await;
    assert_eq!(stats.total_devices, 0);
    assert_eq!(stats.total_groups, 0);

    // with no instances left the model can go too
    engine.manager.delete_model("t1").await.unwrap();
}
