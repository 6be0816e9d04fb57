mod dropout;
mod launch;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use domain::LifecycleEvent;
use domain::device::{
    BindingConfig, BindingProtocol, ConnectionState, Device, DeviceSnapshot, DeviceStatus,
    Source, validate_device_id,
};
use domain::error::{EngineError, Result};
use domain::group::{DropoutConfig, Group, LaunchConfig};
use domain::metrics::Point;
use domain::model::DeviceModel;

use infrastructure::ModelStore;
use infrastructure::proxy::MqttIngress;
use infrastructure::sink::MetricsSink;

use crate::device::{
    DeviceCommand, DeviceRuntime, EngineStats, ProxyDevice, RuntimeSettings, VirtualDeviceSpec,
    spawn_virtual_device,
};
use crate::telemetry::HandlerRegistry;

/// Accepted response for an asynchronous group launch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedLaunch {
    pub accepted_count: usize,
    pub estimated_duration_ms: u64,
}

/// Accepted response for an asynchronous dropout.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedDropout {
    pub affected_count: usize,
    pub estimated_duration_ms: u64,
}

/// Engine-level stats, computed from running counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatsSnapshot {
    pub total_devices: usize,
    pub running_devices: u64,
    pub running_simulated: u64,
    pub running_physical: u64,
    pub total_proxy_devices: usize,
    pub total_groups: usize,
    pub total_models: usize,
    pub total_messages_sent: u64,
    pub total_bytes_sent: u64,
    pub uptime_seconds: u64,
}

/// Per-device metrics view.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetrics {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub last_telemetry: Option<chrono::DateTime<chrono::Utc>>,
    pub connection_duration: f64,
    pub connection_state: ConnectionState,
}

/// Summary view of a group.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub id: String,
    pub model_id: String,
    pub expected_count: usize,
    pub id_pattern: String,
    pub member_count: usize,
    pub running_members: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Filters for the device listing.
#[derive(Debug, Default, Clone)]
pub struct DeviceQuery {
    pub model_id: Option<String>,
    pub group_id: Option<String>,
    pub status: Option<DeviceStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

struct ModelEntry {
    model: DeviceModel,
    instances: usize,
}

/// Per-device control block: the handles the manager needs to talk to (or
/// tear down) the device's tasks. Guarded by a plain mutex; never held
/// across await points.
#[derive(Default)]
struct DeviceControl {
    cmd_tx: Option<mpsc::Sender<DeviceCommand>>,
    task: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
    binding: Option<BindingConfig>,
    ingress: Option<MqttIngress>,
    pump: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct DeviceEntry {
    record: Device,
    runtime: Arc<DeviceRuntime>,
    /// Serializes manager-side lifecycle operations for this device.
    transition: Arc<tokio::sync::Mutex<()>>,
    control: Arc<std::sync::Mutex<DeviceControl>>,
    proxy: Option<Arc<ProxyDevice>>,
}

struct GroupEntry {
    group: Group,
    launcher: Option<CancellationToken>,
    dropout: Option<CancellationToken>,
}

#[derive(Default)]
struct Catalog {
    models: HashMap<String, ModelEntry>,
    devices: HashMap<String, DeviceEntry>,
    groups: HashMap<String, GroupEntry>,
    proxy_count: usize,
}

/// Process-scope registry of models, devices and groups, and the sole
/// author of lifecycle transitions. Holds the catalog lock only long
/// enough to update indices; connects, publishes and sleeps all happen on
/// per-device tasks.
pub struct DeviceManager {
    catalog: RwLock<Catalog>,
    stats: Arc<EngineStats>,
    sink: Arc<MetricsSink>,
    store: ModelStore,
    settings: RuntimeSettings,
    registry: Arc<HandlerRegistry>,
    max_group_size: usize,
    started: Instant,
}

impl DeviceManager {
    pub fn new(
        store: ModelStore,
        sink: Arc<MetricsSink>,
        settings: RuntimeSettings,
        max_group_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog: RwLock::new(Catalog::default()),
            stats: Arc::new(EngineStats::default()),
            sink,
            store,
            settings,
            registry: Arc::new(HandlerRegistry::builtin()),
            max_group_size,
            started: Instant::now(),
        })
    }

    /// Loads persisted models from the model directory into the catalog.
    pub async fn load_models(&self) -> anyhow::Result<usize> {
        let models = self.store.scan().await?;
        let mut catalog = self.catalog.write().await;
        let count = models.len();
        for model in models {
            catalog.models.insert(
                model.id.clone(),
                ModelEntry {
                    model,
                    instances: 0,
                },
            );
        }
        Ok(count)
    }

    /// Emits an `engine_stats` point on a fixed cadence until cancelled.
    pub fn spawn_stats_task(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let stats = manager.stats().await;
                manager.sink.submit(Point::engine_stats(
                    stats.running_devices,
                    stats.running_simulated,
                    stats.running_physical,
                    stats.total_messages_sent,
                    stats.total_bytes_sent,
                    stats.total_groups as u64,
                ));
            }
        })
    }

    // ------------------------------------------------------------------
    // Models

    pub async fn register_model(&self, model: DeviceModel) -> Result<(DeviceModel, bool)> {
        model.validate()?;

        {
            let mut catalog = self.catalog.write().await;
            if let Some(existing) = catalog.models.get(&model.id) {
                if existing.model == model {
                    // identical re-registration is a no-op
                    return Ok((model, false));
                }
                return Err(EngineError::AlreadyExists(format!(
                    "model {} is registered with a different spec",
                    model.id
                )));
            }
            catalog.models.insert(
                model.id.clone(),
                ModelEntry {
                    model: model.clone(),
                    instances: 0,
                },
            );
        }

        if let Err(e) = self.store.save(&model).await {
            self.catalog.write().await.models.remove(&model.id);
            return Err(EngineError::Internal(format!(
                "failed to persist model {}: {e}",
                model.id
            )));
        }

        info!(model_id = %model.id, "Model registered");
        Ok((model, true))
    }

    pub async fn list_models(&self) -> Vec<DeviceModel> {
        let catalog = self.catalog.read().await;
        let mut models: Vec<_> = catalog.models.values().map(|e| e.model.clone()).collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub async fn get_model(&self, id: &str) -> Result<DeviceModel> {
        let catalog = self.catalog.read().await;
        catalog
            .models
            .get(id)
            .map(|e| e.model.clone())
            .ok_or_else(|| EngineError::NotFound(format!("model {id}")))
    }

    pub async fn delete_model(&self, id: &str) -> Result<()> {
        {
            let mut catalog = self.catalog.write().await;
            let entry = catalog
                .models
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("model {id}")))?;
            if entry.instances > 0 {
                return Err(EngineError::Busy(format!(
                    "model {id} has {} device(s)",
                    entry.instances
                )));
            }
            catalog.models.remove(id);
        }
        self.store
            .remove(id)
            .await
            .map_err(|e| EngineError::Internal(format!("failed to remove model file: {e}")))?;
        info!(model_id = %id, "Model deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Devices

    pub async fn create_device(
        &self,
        model_id: &str,
        device_id: Option<String>,
        group_id: Option<String>,
    ) -> Result<DeviceSnapshot> {
        let id = match device_id {
            Some(id) => {
                validate_device_id(&id)?;
                id
            }
            None => format!("{model_id}-{}", Uuid::new_v4().simple()),
        };

        let mut catalog = self.catalog.write().await;
        let entry = self.build_device_entry(&mut catalog, model_id, id, group_id)?;
        Ok(snapshot(&entry))
    }

    /// Builds and indexes one device under an already-held write lock.
    fn build_device_entry(
        &self,
        catalog: &mut Catalog,
        model_id: &str,
        device_id: String,
        group_id: Option<String>,
    ) -> Result<DeviceEntry> {
        let model_entry = catalog
            .models
            .get(model_id)
            .ok_or_else(|| EngineError::NotFound(format!("model {model_id}")))?;
        let source = model_entry.model.source();

        if catalog.devices.contains_key(&device_id) {
            return Err(EngineError::AlreadyExists(format!("device {device_id}")));
        }

        let record = Device::new(device_id.clone(), model_id.to_string(), group_id, source);
        let runtime = DeviceRuntime::new(source, self.stats.clone());
        let proxy = (source == Source::Physical)
            .then(|| ProxyDevice::new(record.clone(), runtime.clone(), self.sink.clone()));

        let entry = DeviceEntry {
            record,
            runtime,
            transition: Arc::new(tokio::sync::Mutex::new(())),
            control: Arc::new(std::sync::Mutex::new(DeviceControl::default())),
            proxy,
        };

        catalog.devices.insert(device_id, entry.clone());
        if let Some(model) = catalog.models.get_mut(model_id) {
            model.instances += 1;
        }
        if entry.proxy.is_some() {
            catalog.proxy_count += 1;
        }
        Ok(entry)
    }

    async fn entry(&self, id: &str) -> Result<DeviceEntry> {
        let catalog = self.catalog.read().await;
        catalog
            .devices
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("device {id}")))
    }

    pub async fn get_device(&self, id: &str) -> Result<DeviceSnapshot> {
        Ok(snapshot(&self.entry(id).await?))
    }

    pub async fn list_devices(&self, query: &DeviceQuery) -> Vec<DeviceSnapshot> {
        let catalog = self.catalog.read().await;
        let mut entries: Vec<_> = catalog
            .devices
            .values()
            .filter(|e| {
                query
                    .model_id
                    .as_deref()
                    .is_none_or(|m| e.record.model_id == m)
                    && query
                        .group_id
                        .as_deref()
                        .is_none_or(|g| e.record.group_id.as_deref() == Some(g))
                    && query.status.is_none_or(|s| e.runtime.status() == s)
            })
            .collect();
        entries.sort_by(|a, b| a.record.id.cmp(&b.record.id));

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(100);
        entries
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(snapshot)
            .collect()
    }

    pub async fn device_metrics(&self, id: &str) -> Result<DeviceMetrics> {
        let entry = self.entry(id).await?;
        let connection_duration = match entry.runtime.started_at() {
            Some(started) if entry.runtime.status().is_running() => {
                (chrono::Utc::now() - started).num_milliseconds().max(0) as f64 / 1_000.0
            }
            _ => 0.0,
        };
        Ok(DeviceMetrics {
            messages_sent: entry.runtime.messages_sent.load(Ordering::Relaxed),
            bytes_sent: entry.runtime.bytes_sent.load(Ordering::Relaxed),
            last_telemetry: entry.runtime.last_telemetry(),
            connection_duration,
            connection_state: entry.runtime.connection(),
        })
    }

    /// Moves the device into `Starting` and spawns its supervisor; the
    /// transition to `Running` is asynchronous. Idempotent for devices
    /// that are already started.
    pub async fn start_device(&self, id: &str) -> Result<DeviceSnapshot> {
        let entry = self.entry(id).await?;
        if entry.proxy.is_some() {
            return Err(EngineError::Conflict(
                "proxy devices are driven by bind/unbind".to_string(),
            ));
        }
        let model = self.get_model(&entry.record.model_id).await?;

        let _guard = entry.transition.lock().await;
        let status = entry.runtime.status();
        if status == DeviceStatus::Starting || status.is_running() {
            return Ok(snapshot(&entry));
        }
        entry.runtime.transition(|s| s.to_starting())?;

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = spawn_virtual_device(
            VirtualDeviceSpec {
                record: entry.record.clone(),
                model,
                runtime: entry.runtime.clone(),
                sink: self.sink.clone(),
                settings: self.settings.clone(),
                registry: self.registry.clone(),
            },
            cmd_rx,
            cancel.clone(),
        );

        let mut control = entry.control.lock().unwrap();
        control.cmd_tx = Some(cmd_tx);
        control.task = Some(task);
        control.cancel = Some(cancel);
        drop(control);

        Ok(snapshot(&entry))
    }

    /// Graceful stop with a deadline, then force. No-op for devices that
    /// are not started. Proxy devices are unaffected.
    pub async fn stop_device(&self, id: &str) -> Result<DeviceSnapshot> {
        let entry = self.entry(id).await?;
        if entry.proxy.is_some() {
            return Ok(snapshot(&entry));
        }

        let _guard = entry.transition.lock().await;
        if !entry.runtime.status().is_active() {
            return Ok(snapshot(&entry));
        }

        let (cmd_tx, task, cancel) = {
            let mut control = entry.control.lock().unwrap();
            (
                control.cmd_tx.take(),
                control.task.take(),
                control.cancel.take(),
            )
        };

        if let Some(tx) = cmd_tx {
            let _ = tx.send(DeviceCommand::Stop).await;
        }
        if let Some(mut task) = task {
            if tokio::time::timeout(self.settings.graceful_stop, &mut task)
                .await
                .is_err()
            {
                warn!(device_id = %id, "Graceful stop deadline hit, cancelling");
                if let Some(cancel) = cancel {
                    cancel.cancel();
                }
                if tokio::time::timeout(Duration::from_secs(1), &mut task)
                    .await
                    .is_err()
                {
                    task.abort();
                }
            }
        }
        if entry.runtime.status() != DeviceStatus::Stopped {
            entry.runtime.force_status(DeviceStatus::Stopped);
            entry.runtime.set_connection(ConnectionState::Disconnected);
        }
        Ok(snapshot(&entry))
    }

    pub async fn delete_device(&self, id: &str) -> Result<()> {
        let entry = self.entry(id).await?;

        if entry.proxy.is_some() {
            let _ = self.unbind_device(id).await;
        } else if entry.runtime.status().is_active() {
            self.stop_device(id).await?;
        }

        {
            let mut catalog = self.catalog.write().await;
            let Some(entry) = catalog.devices.remove(id) else {
                return Err(EngineError::NotFound(format!("device {id}")));
            };
            if let Some(model) = catalog.models.get_mut(&entry.record.model_id) {
                model.instances = model.instances.saturating_sub(1);
            }
            if entry.proxy.is_some() {
                catalog.proxy_count = catalog.proxy_count.saturating_sub(1);
            }
            if let Some(group_id) = &entry.record.group_id {
                if let Some(group) = catalog.groups.get_mut(group_id) {
                    group.group.members.retain(|m| m != id);
                }
            }
        }

        entry.runtime.force_status(DeviceStatus::Deleted);
        self.sink.submit(Point::device_event(
            &entry.record.id,
            &entry.record.model_id,
            entry.record.group_id.as_deref(),
            entry.record.source,
            LifecycleEvent::Deleted,
        ));
        debug!(device_id = %id, "Device deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Groups

    pub async fn create_group(
        &self,
        model_id: &str,
        count: usize,
        group_id: Option<String>,
        id_pattern: Option<String>,
    ) -> Result<GroupSnapshot> {
        if count < 1 {
            return Err(EngineError::Validation(
                "group count must be >= 1".to_string(),
            ));
        }
        if count > self.max_group_size {
            return Err(EngineError::Validation(format!(
                "group count exceeds the maximum of {}",
                self.max_group_size
            )));
        }

        let gid = group_id.unwrap_or_else(|| {
            format!("{model_id}-grp-{}", &Uuid::new_v4().simple().to_string()[..8])
        });
        let pattern = id_pattern.unwrap_or_else(|| Group::DEFAULT_ID_PATTERN.to_string());

        let mut catalog = self.catalog.write().await;
        if !catalog.models.contains_key(model_id) {
            return Err(EngineError::NotFound(format!("model {model_id}")));
        }
        if catalog.groups.contains_key(&gid) {
            return Err(EngineError::AlreadyExists(format!("group {gid}")));
        }

        // All-or-nothing under the single write hold: pre-check every
        // member id so creation never partially commits.
        let member_ids: Vec<String> = (0..count)
            .map(|i| Group::member_id(&pattern, model_id, i))
            .collect();
        for id in &member_ids {
            validate_device_id(id)?;
            if catalog.devices.contains_key(id) {
                return Err(EngineError::AlreadyExists(format!("device {id}")));
            }
        }

        let mut group = Group::new(gid.clone(), model_id.to_string(), count, pattern);
        for id in member_ids {
            if let Err(e) =
                self.build_device_entry(&mut catalog, model_id, id.clone(), Some(gid.clone()))
            {
                // roll back members created before the failure
                for created in &group.members {
                    if let Some(entry) = catalog.devices.remove(created) {
                        if let Some(model) = catalog.models.get_mut(&entry.record.model_id) {
                            model.instances = model.instances.saturating_sub(1);
                        }
                    }
                }
                return Err(e);
            }
            group.members.push(id);
        }

        let snapshot = GroupSnapshot {
            id: group.id.clone(),
            model_id: group.model_id.clone(),
            expected_count: group.expected_count,
            id_pattern: group.id_pattern.clone(),
            member_count: group.members.len(),
            running_members: 0,
            created_at: group.created_at,
        };
        catalog.groups.insert(
            gid.clone(),
            GroupEntry {
                group,
                launcher: None,
                dropout: None,
            },
        );
        info!(group_id = %gid, members = count, "Group created");
        Ok(snapshot)
    }

    pub async fn get_group(&self, id: &str) -> Result<GroupSnapshot> {
        let catalog = self.catalog.read().await;
        let entry = catalog
            .groups
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("group {id}")))?;
        let running = entry
            .group
            .members
            .iter()
            .filter_map(|m| catalog.devices.get(m))
            .filter(|d| d.runtime.status().is_running())
            .count();
        Ok(GroupSnapshot {
            id: entry.group.id.clone(),
            model_id: entry.group.model_id.clone(),
            expected_count: entry.group.expected_count,
            id_pattern: entry.group.id_pattern.clone(),
            member_count: entry.group.members.len(),
            running_members: running,
            created_at: entry.group.created_at,
        })
    }

    pub async fn list_groups(&self) -> Vec<GroupSnapshot> {
        let ids: Vec<String> = {
            let catalog = self.catalog.read().await;
            let mut ids: Vec<_> = catalog.groups.keys().cloned().collect();
            ids.sort();
            ids
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(snapshot) = self.get_group(&id).await {
                out.push(snapshot);
            }
        }
        out
    }

    /// Schedules member starts per the launch strategy and returns
    /// immediately; start transitions are asynchronous. Proxy members are
    /// skipped entirely.
    pub async fn start_group(
        self: &Arc<Self>,
        id: &str,
        config: LaunchConfig,
    ) -> Result<AcceptedLaunch> {
        let members = {
            let catalog = self.catalog.read().await;
            let entry = catalog
                .groups
                .get(id)
                .ok_or_else(|| EngineError::NotFound(format!("group {id}")))?;
            if entry
                .launcher
                .as_ref()
                .is_some_and(|t| !t.is_cancelled())
            {
                return Err(EngineError::Conflict(format!(
                    "group {id} launch already in progress"
                )));
            }
            let mut members: Vec<String> = entry
                .group
                .members
                .iter()
                .filter(|m| {
                    catalog
                        .devices
                        .get(*m)
                        .is_some_and(|d| d.proxy.is_none())
                })
                .cloned()
                .collect();
            members.sort();
            members
        };

        let accepted = AcceptedLaunch {
            accepted_count: members.len(),
            estimated_duration_ms: config.estimated_duration_ms(members.len()),
        };

        let cancel = CancellationToken::new();
        {
            let mut catalog = self.catalog.write().await;
            if let Some(entry) = catalog.groups.get_mut(id) {
                entry.launcher = Some(cancel.clone());
            }
        }
        tokio::spawn(launch::run_launcher(
            self.clone(),
            id.to_string(),
            members,
            config,
            cancel,
        ));

        Ok(accepted)
    }

    pub(super) async fn clear_launcher(&self, group_id: &str) {
        let mut catalog = self.catalog.write().await;
        if let Some(entry) = catalog.groups.get_mut(group_id) {
            entry.launcher = None;
        }
    }

    /// Cancels a pending launch and stops members in ascending id order.
    pub async fn stop_group(&self, id: &str) -> Result<()> {
        let members = {
            let mut catalog = self.catalog.write().await;
            let entry = catalog
                .groups
                .get_mut(id)
                .ok_or_else(|| EngineError::NotFound(format!("group {id}")))?;
            if let Some(launcher) = entry.launcher.take() {
                launcher.cancel();
            }
            if let Some(dropout) = entry.dropout.take() {
                dropout.cancel();
            }
            let mut members = entry.group.members.clone();
            members.sort();
            members
        };

        for member in members {
            if let Err(e) = self.stop_device(&member).await {
                warn!(device_id = %member, error = %e, "Failed to stop group member");
            }
        }
        info!(group_id = %id, "Group stopped");
        Ok(())
    }

    /// Stops the group and removes it together with its members.
    pub async fn delete_group(&self, id: &str) -> Result<()> {
        self.stop_group(id).await?;

        let members = {
            let catalog = self.catalog.read().await;
            catalog
                .groups
                .get(id)
                .map(|e| e.group.members.clone())
                .ok_or_else(|| EngineError::NotFound(format!("group {id}")))?
        };
        for member in members {
            if let Err(e) = self.delete_device(&member).await {
                warn!(device_id = %member, error = %e, "Failed to delete group member");
            }
        }

        self.catalog.write().await.groups.remove(id);
        info!(group_id = %id, "Group deleted");
        Ok(())
    }

    /// Programmed failures: selects running simulated members and tears
    /// their links down per the dropout schedule.
    pub async fn dropout_group(
        self: &Arc<Self>,
        id: &str,
        config: DropoutConfig,
    ) -> Result<AcceptedDropout> {
        config.validate()?;
        dropout::start_dropout(self, id, config).await
    }

    /// Sends a link-sever command into a running device's supervisor.
    pub(super) async fn sever_device(
        &self,
        id: &str,
        reconnect: bool,
        reconnect_delay: Duration,
    ) {
        let Ok(entry) = self.entry(id).await else {
            return;
        };
        let cmd_tx = entry.control.lock().unwrap().cmd_tx.clone();
        if let Some(tx) = cmd_tx {
            let _ = tx
                .send(DeviceCommand::Sever {
                    reconnect,
                    reconnect_delay,
                })
                .await;
        }
    }

    pub(super) async fn set_group_dropout(&self, id: &str, token: Option<CancellationToken>) {
        let mut catalog = self.catalog.write().await;
        if let Some(entry) = catalog.groups.get_mut(id) {
            entry.dropout = token;
        }
    }

    /// Running simulated members of a group, ascending by id.
    pub(super) async fn running_simulated_members(&self, group_id: &str) -> Result<Vec<String>> {
        let catalog = self.catalog.read().await;
        let entry = catalog
            .groups
            .get(group_id)
            .ok_or_else(|| EngineError::NotFound(format!("group {group_id}")))?;
        let mut members: Vec<String> = entry
            .group
            .members
            .iter()
            .filter(|m| {
                catalog.devices.get(*m).is_some_and(|d| {
                    d.record.source == Source::Simulated && d.runtime.status().is_running()
                })
            })
            .cloned()
            .collect();
        members.sort();
        Ok(members)
    }

    // ------------------------------------------------------------------
    // Proxy bindings

    /// Binds a proxy device to its external source and starts the ingress.
    pub async fn bind_device(&self, id: &str, mut config: BindingConfig) -> Result<BindingConfig> {
        config.validate()?;
        let entry = self.entry(id).await?;
        let Some(proxy) = entry.proxy.clone() else {
            return Err(EngineError::Conflict(format!(
                "device {id} is not a proxy device"
            )));
        };

        let _guard = entry.transition.lock().await;
        if entry.control.lock().unwrap().binding.is_some() {
            return Err(EngineError::Conflict(format!(
                "device {id} already has an active binding"
            )));
        }

        let mut ingress = None;
        let mut pump = None;
        match config.protocol {
            BindingProtocol::Mqtt => {
                let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);
                ingress = Some(MqttIngress::start(id, &config, tx).await?);
                let pump_proxy = proxy.clone();
                pump = Some(tokio::spawn(async move {
                    while let Some(payload) = rx.recv().await {
                        pump_proxy.ingest_bytes(&payload);
                    }
                }));
                config.webhook_path = None;
            }
            BindingProtocol::Http => {
                config.webhook_path = Some(format!("/api/v1/webhooks/{id}"));
            }
        }

        {
            let mut control = entry.control.lock().unwrap();
            control.binding = Some(config.clone());
            control.ingress = ingress;
            control.pump = pump;
        }

        entry.runtime.transition(|s| s.to_starting())?;
        entry.runtime.transition(|s| s.to_running())?;
        entry.runtime.set_started_at(chrono::Utc::now());
        entry.runtime.set_connection(ConnectionState::Connected);
        self.sink.submit(Point::device_event(
            &entry.record.id,
            &entry.record.model_id,
            entry.record.group_id.as_deref(),
            entry.record.source,
            LifecycleEvent::Started,
        ));

        info!(device_id = %id, protocol = ?config.protocol, "Proxy device bound");
        Ok(config)
    }

    /// Removes the binding and stops the ingress. No residual
    /// subscription survives an unbind.
    pub async fn unbind_device(&self, id: &str) -> Result<()> {
        let entry = self.entry(id).await?;
        if entry.proxy.is_none() {
            return Err(EngineError::Conflict(format!(
                "device {id} is not a proxy device"
            )));
        }

        let _guard = entry.transition.lock().await;
        let (binding, ingress, pump) = {
            let mut control = entry.control.lock().unwrap();
            (
                control.binding.take(),
                control.ingress.take(),
                control.pump.take(),
            )
        };
        if binding.is_none() {
            return Err(EngineError::Conflict(format!("device {id} is not bound")));
        }
        if let Some(ingress) = ingress {
            ingress.stop();
        }
        if let Some(pump) = pump {
            pump.abort();
        }

        if entry.runtime.status().is_active() {
            let _ = entry.runtime.transition(|s| s.to_stopping());
            let _ = entry.runtime.transition(|s| s.to_stopped());
        }
        entry.runtime.set_connection(ConnectionState::Disconnected);
        self.sink.submit(Point::device_event(
            &entry.record.id,
            &entry.record.model_id,
            entry.record.group_id.as_deref(),
            entry.record.source,
            LifecycleEvent::Stopped,
        ));

        info!(device_id = %id, "Proxy device unbound");
        Ok(())
    }

    pub async fn get_binding(&self, id: &str) -> Result<Option<BindingConfig>> {
        let entry = self.entry(id).await?;
        if entry.proxy.is_none() {
            return Err(EngineError::Conflict(format!(
                "device {id} is not a proxy device"
            )));
        }
        Ok(entry.control.lock().unwrap().binding.clone())
    }

    /// Routes a webhook body to its bound HTTP proxy device.
    pub async fn ingest_webhook(&self, id: &str, body: &serde_json::Value) -> Result<()> {
        let entry = self.entry(id).await?;
        let bound_http = entry
            .control
            .lock()
            .unwrap()
            .binding
            .as_ref()
            .is_some_and(|b| b.protocol == BindingProtocol::Http);
        let Some(proxy) = entry.proxy.clone().filter(|_| bound_http) else {
            return Err(EngineError::NotFound(format!(
                "no bound http proxy device {id}"
            )));
        };
        proxy.ingest_json(body)
    }

    // ------------------------------------------------------------------
    // Stats & shutdown

    pub async fn stats(&self) -> EngineStatsSnapshot {
        let (total_devices, total_proxy, total_groups, total_models) = {
            let catalog = self.catalog.read().await;
            (
                catalog.devices.len(),
                catalog.proxy_count,
                catalog.groups.len(),
                catalog.models.len(),
            )
        };
        let running_simulated = self.stats.running_simulated.load(Ordering::Relaxed);
        let running_physical = self.stats.running_physical.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            total_devices,
            running_devices: running_simulated + running_physical,
            running_simulated,
            running_physical,
            total_proxy_devices: total_proxy,
            total_groups,
            total_models,
            total_messages_sent: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes_sent: self.stats.total_bytes.load(Ordering::Relaxed),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }

    /// Engine shutdown: cancel orchestration, stop every active device
    /// concurrently, tear down proxy ingress.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("Stopping all devices...");
        let (device_ids, proxy_ids) = {
            let mut catalog = self.catalog.write().await;
            for entry in catalog.groups.values_mut() {
                if let Some(launcher) = entry.launcher.take() {
                    launcher.cancel();
                }
                if let Some(dropout) = entry.dropout.take() {
                    dropout.cancel();
                }
            }
            let device_ids: Vec<String> = catalog
                .devices
                .values()
                .filter(|e| e.proxy.is_none() && e.runtime.status().is_active())
                .map(|e| e.record.id.clone())
                .collect();
            let proxy_ids: Vec<String> = catalog
                .devices
                .values()
                .filter(|e| e.proxy.is_some())
                .map(|e| e.record.id.clone())
                .collect();
            (device_ids, proxy_ids)
        };

        let mut stops = tokio::task::JoinSet::new();
        for id in device_ids {
            let manager = self.clone();
            stops.spawn(async move {
                if let Err(e) = manager.stop_device(&id).await {
                    error!(device_id = %id, error = %e, "Shutdown stop failed");
                }
            });
        }
        while stops.join_next().await.is_some() {}

        for id in proxy_ids {
            let _ = self.unbind_device(&id).await;
        }
        info!("All devices stopped");
    }
}

fn snapshot(entry: &DeviceEntry) -> DeviceSnapshot {
    let runtime = &entry.runtime;
    let is_proxy = entry.proxy.is_some();
    DeviceSnapshot {
        id: entry.record.id.clone(),
        model_id: entry.record.model_id.clone(),
        group_id: entry.record.group_id.clone(),
        source: entry.record.source,
        status: runtime.status(),
        connection_state: runtime.connection(),
        messages_sent: runtime.messages_sent.load(Ordering::Relaxed),
        bytes_sent: runtime.bytes_sent.load(Ordering::Relaxed),
        messages_received: is_proxy.then(|| runtime.messages_received.load(Ordering::Relaxed)),
        bytes_received: is_proxy.then(|| runtime.bytes_received.load(Ordering::Relaxed)),
        last_telemetry_at: runtime.last_telemetry(),
        created_at: entry.record.created_at,
        started_at: runtime.started_at(),
        binding: entry.control.lock().unwrap().binding.clone(),
    }
}
