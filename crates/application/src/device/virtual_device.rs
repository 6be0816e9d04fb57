use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use domain::LifecycleEvent;
use domain::device::{ConnectionState, Device, DeviceStatus};
use domain::interpolate::{PatternContext, interpolate, needs_timestamp};
use domain::metrics::{FieldValue, Point};
use domain::model::{AttributeSpec, ConnectionSpec, DeviceModel, Protocol};

use infrastructure::adapters::{
    CoapAdapter, CoapEndpoint, HttpAdapter, HttpEndpoint, MqttAdapter, MqttEndpoint,
    ProtocolAdapter, Publish, PublishHandle,
};
use infrastructure::sink::MetricsSink;

use crate::telemetry::{GeneratedValue, Generator, HandlerRegistry};

use super::{DeviceCommand, DeviceRuntime, RuntimeSettings};

/// Consecutive publish failures before the device gives up on the link
/// and re-attempts the connection.
const FAILURE_THRESHOLD: u32 = 3;

/// Everything a virtual device task needs to run.
pub struct VirtualDeviceSpec {
    pub record: Device,
    pub model: DeviceModel,
    pub runtime: Arc<DeviceRuntime>,
    pub sink: Arc<MetricsSink>,
    pub settings: RuntimeSettings,
    pub registry: Arc<HandlerRegistry>,
}

/// Spawns the device supervisor. The caller has already moved the device
/// into `Starting`; everything after that happens inside the task.
pub fn spawn_virtual_device(
    spec: VirtualDeviceSpec,
    cmd_rx: mpsc::Receiver<DeviceCommand>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(spec, cmd_rx, cancel))
}

async fn run(spec: VirtualDeviceSpec, mut cmd_rx: mpsc::Receiver<DeviceCommand>, cancel: CancellationToken) {
    let VirtualDeviceSpec {
        record,
        model,
        runtime,
        sink,
        settings,
        registry,
    } = spec;

    // Generator state is created at start and dropped at stop.
    let mut generators: Vec<(AttributeSpec, Generator)> = Vec::with_capacity(model.telemetry.len());
    for attr in &model.telemetry {
        match Generator::build(&attr.generator, attr.data_type, &record.id, &attr.name, &registry) {
            Ok(generator) => generators.push((attr.clone(), generator)),
            Err(e) => {
                warn!(device_id = %record.id, attribute = %attr.name, error = %e, "Generator setup failed");
                fail_start(&record, &model, &runtime, &sink).await;
                return;
            }
        }
    }

    let (outcome_tx, mut outcome_rx) = mpsc::channel(256);
    let mut adapter = build_adapter(&model, &record, &settings, outcome_tx);

    let connect_started = Instant::now();
    if let Err(e) = adapter.connect().await {
        warn!(device_id = %record.id, error = %e, "Connect failed");
        fail_start(&record, &model, &runtime, &sink).await;
        return;
    }
    runtime.set_connection(ConnectionState::Connecting);
    if !wait_connected(&adapter, settings.connect_timeout, &cancel).await {
        adapter.close().await;
        if cancel.is_cancelled() {
            // stopped while connecting; wind down without an error event
            let _ = runtime.transition(|s| s.to_stopping());
            let _ = runtime.transition(|s| s.to_stopped());
            runtime.set_connection(ConnectionState::Disconnected);
            return;
        }
        warn!(device_id = %record.id, timeout_ms = settings.connect_timeout.as_millis() as u64, "Connect timed out");
        fail_start(&record, &model, &runtime, &sink).await;
        return;
    }
    let latency_ms = connect_started.elapsed().as_secs_f64() * 1_000.0;

    runtime.set_connection(ConnectionState::Connected);
    if runtime.transition(|s| s.to_running()).is_err() {
        // stopped while connecting; unwind quietly
        adapter.close().await;
        return;
    }
    runtime.set_started_at(Utc::now());
    info!(device_id = %record.id, protocol = model.protocol.as_str(), "Device running");
    sink.submit(Point::device_event(
        &record.id,
        &record.model_id,
        record.group_id.as_deref(),
        record.source,
        LifecycleEvent::Started,
    ));
    sink.submit(Point::connection(
        &record.id,
        model.protocol,
        record.source,
        true,
        latency_ms,
    ));

    // One independent periodic task per attribute; no shared clock.
    let attr_cancel = CancellationToken::new();
    let publish_handle = adapter.publish_handle();
    let mut attr_tasks = Vec::with_capacity(generators.len());
    for (attr, generator) in generators {
        attr_tasks.push(tokio::spawn(attribute_loop(
            attr,
            generator,
            record.clone(),
            model.connection.clone(),
            publish_handle.clone(),
            attr_cancel.clone(),
        )));
    }

    let mut consecutive_failures: u32 = 0;
    let mut state_rx = adapter.watch_state().clone();

    'supervise: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                stop_device(&record, &model, &runtime, &sink, &mut adapter, &attr_cancel).await;
                break 'supervise;
            }

            cmd = cmd_rx.recv() => match cmd {
                None | Some(DeviceCommand::Stop) => {
                    stop_device(&record, &model, &runtime, &sink, &mut adapter, &attr_cancel).await;
                    break 'supervise;
                }
                Some(DeviceCommand::Sever { reconnect, reconnect_delay }) => {
                    debug!(device_id = %record.id, reconnect, "Link severed by dropout");
                    adapter.sever().await;
                    runtime.set_connection(ConnectionState::Reconnecting);
                    if runtime.transition(|s| s.to_reconnecting()).is_ok() {
                        emit_reconnecting(&record, &model, &sink);
                    }

                    if reconnect {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                stop_device(&record, &model, &runtime, &sink, &mut adapter, &attr_cancel).await;
                                break 'supervise;
                            }
                            _ = tokio::time::sleep(reconnect_delay) => {}
                        }
                        // adapter-level backoff takes over if this fails
                        if let Err(e) = adapter.connect().await {
                            warn!(device_id = %record.id, error = %e, "Re-establish after dropout failed");
                        }
                        state_rx = adapter.watch_state().clone();
                    } else {
                        attr_cancel.cancel();
                        adapter.close().await;
                        let _ = runtime.transition(|s| s.to_stopped());
                        runtime.set_connection(ConnectionState::Disconnected);
                        sink.submit(Point::device_event(
                            &record.id,
                            &record.model_id,
                            record.group_id.as_deref(),
                            record.source,
                            LifecycleEvent::Stopped,
                        ));
                        break 'supervise;
                    }
                }
            },

            outcome = outcome_rx.recv() => {
                let Some(outcome) = outcome else { continue };
                if outcome.success {
                    consecutive_failures = 0;
                    runtime.mark_sent(outcome.bytes);

                    let mut point = Point::telemetry(
                        &record.id,
                        &record.model_id,
                        record.group_id.as_deref(),
                        record.source,
                    );
                    if let Some(unit) = unit_of(&model, &outcome.attribute) {
                        point = point.tag("unit", unit);
                    }
                    // binary attributes have no scalar; record the size
                    let field = outcome
                        .value
                        .unwrap_or(FieldValue::Integer(outcome.bytes as i64));
                    sink.submit(point.field(outcome.attribute, field));
                } else {
                    runtime.publish_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    consecutive_failures += 1;
                    if consecutive_failures == FAILURE_THRESHOLD
                        && runtime.status() == DeviceStatus::Running
                    {
                        warn!(device_id = %record.id, "Publish failures crossed threshold, reconnecting");
                        runtime.set_connection(ConnectionState::Reconnecting);
                        if runtime.transition(|s| s.to_reconnecting()).is_ok() {
                            emit_reconnecting(&record, &model, &sink);
                        }
                        if let Err(e) = adapter.connect().await {
                            warn!(device_id = %record.id, error = %e, "Reconnect attempt failed");
                        }
                        state_rx = adapter.watch_state().clone();
                    }
                }
            },

            changed = state_rx.changed() => {
                if changed.is_err() {
                    continue;
                }
                let link = *state_rx.borrow_and_update();
                runtime.set_connection(link);
                match link {
                    ConnectionState::Connected => {
                        consecutive_failures = 0;
                        if runtime.status() == DeviceStatus::Reconnecting
                            && runtime.transition(|s| s.to_running()).is_ok()
                        {
                            info!(device_id = %record.id, "Link re-established");
                            sink.submit(Point::connection(
                                &record.id,
                                model.protocol,
                                record.source,
                                true,
                                0.0,
                            ));
                        }
                    }
                    ConnectionState::Reconnecting => {
                        if runtime.status() == DeviceStatus::Running
                            && runtime.transition(|s| s.to_reconnecting()).is_ok()
                        {
                            emit_reconnecting(&record, &model, &sink);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    for task in attr_tasks {
        task.abort();
    }
    debug!(device_id = %record.id, "Device supervisor exited");
}

/// Periodic loop for one attribute. The interval keeps its own next-fire
/// time and skips missed ticks instead of bursting to catch up.
async fn attribute_loop(
    attr: AttributeSpec,
    mut generator: Generator,
    record: Device,
    connection: ConnectionSpec,
    publish: PublishHandle,
    cancel: CancellationToken,
) {
    let ctx_pattern = connection.topic_pattern().to_string();
    let reresolve = needs_timestamp(&ctx_pattern);
    let static_topic = {
        let ctx = PatternContext {
            device_id: &record.id,
            model_id: &record.model_id,
            group_id: record.group_id.as_deref(),
        };
        interpolate(&ctx_pattern, &ctx, None)
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(attr.interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Utc::now();
        let topic = if reresolve {
            let ctx = PatternContext {
                device_id: &record.id,
                model_id: &record.model_id,
                group_id: record.group_id.as_deref(),
            };
            interpolate(&ctx_pattern, &ctx, Some(now))
        } else {
            static_topic.clone()
        };

        let (payload, binary, field) = match generator.next_value(now) {
            GeneratedValue::Json(value) => {
                let field = FieldValue::from_json(&value);
                let mut body = serde_json::Map::new();
                body.insert(attr.name.clone(), value);
                body.insert(
                    "timestamp".to_string(),
                    json!(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
                body.insert("deviceId".to_string(), json!(record.id));
                if let Some(unit) = &attr.unit {
                    body.insert("unit".to_string(), json!(unit));
                }
                let bytes = serde_json::to_vec(&serde_json::Value::Object(body))
                    .unwrap_or_default();
                (bytes, false, field)
            }
            GeneratedValue::Bytes(bytes) => (bytes, true, None),
        };

        publish.submit(Publish {
            attribute: attr.name.clone(),
            topic,
            payload,
            binary,
            value: field,
        });
    }
}

fn build_adapter(
    model: &DeviceModel,
    record: &Device,
    settings: &RuntimeSettings,
    outcome_tx: tokio::sync::mpsc::Sender<infrastructure::adapters::PublishOutcome>,
) -> ProtocolAdapter {
    let ctx = PatternContext {
        device_id: &record.id,
        model_id: &record.model_id,
        group_id: record.group_id.as_deref(),
    };
    let connection = &model.connection;
    let host = connection.host_or(&settings.default_broker_host).to_string();

    match model.protocol {
        Protocol::Mqtt => {
            let client_id = interpolate(connection.client_id_pattern(), &ctx, None);
            // passwordRef names an environment variable holding the secret
            let password = connection
                .password_ref
                .as_deref()
                .and_then(|name| std::env::var(name).ok());
            ProtocolAdapter::Mqtt(MqttAdapter::new(
                MqttEndpoint {
                    host,
                    port: connection.port,
                    client_id,
                    keepalive_secs: connection.keepalive_secs,
                    qos: connection.qos,
                    username: connection.username.clone(),
                    password,
                    publish_timeout: settings.publish_timeout,
                },
                outcome_tx,
                settings.queue_capacity,
            ))
        }
        Protocol::Coap => ProtocolAdapter::Coap(CoapAdapter::new(
            CoapEndpoint {
                host,
                port: connection.port,
                resource_path: interpolate(connection.resource_path(), &ctx, None),
                confirmable: connection.qos > 0,
                ack_timeout: settings.publish_timeout,
                failure_threshold: FAILURE_THRESHOLD,
            },
            outcome_tx,
            settings.queue_capacity,
        )),
        Protocol::Http => {
            let path = connection.base_path.as_deref().unwrap_or("/telemetry");
            ProtocolAdapter::Http(HttpAdapter::new(
                HttpEndpoint {
                    base_url: format!("http://{}:{}", host, connection.port),
                    path: interpolate(path, &ctx, None),
                    request_timeout: settings.publish_timeout,
                    failure_threshold: FAILURE_THRESHOLD,
                },
                outcome_tx,
                settings.queue_capacity,
            ))
        }
    }
}

/// Blocks until the adapter reports `Connected`, the timeout passes, or
/// the device is cancelled.
async fn wait_connected(
    adapter: &ProtocolAdapter,
    timeout: Duration,
    cancel: &CancellationToken,
) -> bool {
    let mut rx = adapter.watch_state().clone();
    if rx.borrow().is_connected() {
        return true;
    }
    let watch = async {
        loop {
            if rx.changed().await.is_err() {
                return false;
            }
            if rx.borrow().is_connected() {
                return true;
            }
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(timeout) => false,
        connected = watch => connected,
    }
}

async fn fail_start(
    record: &Device,
    model: &DeviceModel,
    runtime: &Arc<DeviceRuntime>,
    sink: &Arc<MetricsSink>,
) {
    let _ = runtime.transition(|s| s.to_error());
    runtime.set_connection(ConnectionState::Disconnected);
    sink.submit(Point::device_event(
        &record.id,
        &record.model_id,
        record.group_id.as_deref(),
        record.source,
        LifecycleEvent::Error,
    ));
    sink.submit(Point::connection(
        &record.id,
        model.protocol,
        record.source,
        false,
        0.0,
    ));
}

async fn stop_device(
    record: &Device,
    model: &DeviceModel,
    runtime: &Arc<DeviceRuntime>,
    sink: &Arc<MetricsSink>,
    adapter: &mut ProtocolAdapter,
    attr_cancel: &CancellationToken,
) {
    let _ = runtime.transition(|s| s.to_stopping());
    attr_cancel.cancel();
    adapter.close().await;
    let _ = runtime.transition(|s| s.to_stopped());
    runtime.set_connection(ConnectionState::Disconnected);
    info!(device_id = %record.id, "Device stopped");
    sink.submit(Point::device_event(
        &record.id,
        &record.model_id,
        record.group_id.as_deref(),
        record.source,
        LifecycleEvent::Stopped,
    ));
    sink.submit(Point::connection(
        &record.id,
        model.protocol,
        record.source,
        false,
        0.0,
    ));
}

fn emit_reconnecting(record: &Device, model: &DeviceModel, sink: &Arc<MetricsSink>) {
    sink.submit(Point::device_event(
        &record.id,
        &record.model_id,
        record.group_id.as_deref(),
        record.source,
        LifecycleEvent::Reconnecting,
    ));
    sink.submit(Point::connection(
        &record.id,
        model.protocol,
        record.source,
        false,
        0.0,
    ));
}

fn unit_of<'a>(model: &'a DeviceModel, attribute: &str) -> Option<&'a str> {
    model
        .telemetry
        .iter()
        .find(|a| a.name == attribute)
        .and_then(|a| a.unit.as_deref())
}
