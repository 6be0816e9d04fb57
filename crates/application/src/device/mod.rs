mod proxy_device;
mod virtual_device;

pub use proxy_device::ProxyDevice;
pub use virtual_device::{VirtualDeviceSpec, spawn_virtual_device};

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use domain::device::{ConnectionState, DeviceStatus, Source};
use domain::error::{EngineError, Result};

/// Engine-wide running counters, shared by every device runtime so
/// `getStats` never scans the catalog.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub running_simulated: AtomicU64,
    pub running_physical: AtomicU64,
    pub total_messages: AtomicU64,
    pub total_bytes: AtomicU64,
}

/// Control messages into a device supervisor. Lifecycle transitions are
/// message-passing; the manager owns only indices.
#[derive(Debug, Clone)]
pub enum DeviceCommand {
    Stop,
    Sever {
        reconnect: bool,
        reconnect_delay: Duration,
    },
}

/// Knobs every device task runs with, derived from the engine config.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
    pub queue_capacity: usize,
    pub graceful_stop: Duration,
    pub default_broker_host: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
            queue_capacity: 1_024,
            graceful_stop: Duration::from_secs(5),
            default_broker_host: "localhost".to_string(),
        }
    }
}

/// Shared runtime cell for one device: status, link state and counters.
/// Written by the device's tasks, read by the control plane. Counters are
/// monotonically non-decreasing.
pub struct DeviceRuntime {
    source: Source,
    stats: std::sync::Arc<EngineStats>,
    status: RwLock<DeviceStatus>,
    connection: RwLock<ConnectionState>,
    pub messages_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub dropped_payloads: AtomicU64,
    pub publish_failures: AtomicU64,
    last_telemetry: RwLock<Option<DateTime<Utc>>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

impl DeviceRuntime {
    pub fn new(source: Source, stats: std::sync::Arc<EngineStats>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            source,
            stats,
            status: RwLock::new(DeviceStatus::Created),
            connection: RwLock::new(ConnectionState::Disconnected),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            dropped_payloads: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            last_telemetry: RwLock::new(None),
            started_at: RwLock::new(None),
        })
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn status(&self) -> DeviceStatus {
        *self.status.read().unwrap()
    }

    /// Applies a state-machine transition atomically, keeping the engine's
    /// running counters in step. Illegal transitions surface as `Conflict`.
    pub fn transition<F>(&self, apply: F) -> Result<DeviceStatus>
    where
        F: FnOnce(&DeviceStatus) -> std::result::Result<DeviceStatus, &'static str>,
    {
        let mut status = self.status.write().unwrap();
        match apply(&status) {
            Ok(next) => {
                self.adjust_running(*status, next);
                *status = next;
                Ok(next)
            }
            Err(msg) => Err(EngineError::Conflict(msg.to_string())),
        }
    }

    /// Unconditional status write (deletion path).
    pub fn force_status(&self, next: DeviceStatus) {
        let mut status = self.status.write().unwrap();
        self.adjust_running(*status, next);
        *status = next;
    }

    fn adjust_running(&self, from: DeviceStatus, to: DeviceStatus) {
        let counter = match self.source {
            Source::Simulated => &self.stats.running_simulated,
            Source::Physical => &self.stats.running_physical,
        };
        match (from.is_running(), to.is_running()) {
            (false, true) => {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                counter.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn connection(&self) -> ConnectionState {
        *self.connection.read().unwrap()
    }

    pub fn set_connection(&self, state: ConnectionState) {
        *self.connection.write().unwrap() = state;
    }

    /// Records one successful publish.
    pub fn mark_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
        self.stats.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_telemetry.write().unwrap() = Some(Utc::now());
    }

    /// Records one payload received by a proxy device.
    pub fn mark_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_telemetry.write().unwrap() = Some(Utc::now());
    }

    pub fn last_telemetry(&self) -> Option<DateTime<Utc>> {
        *self.last_telemetry.read().unwrap()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read().unwrap()
    }

    pub fn set_started_at(&self, when: DateTime<Utc>) {
        *self.started_at.write().unwrap() = Some(when);
    }
}
