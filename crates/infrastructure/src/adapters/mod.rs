//! Protocol egress. One adapter instance per simulated device; the
//! adapter owns the connection and the publish queue, the device observes
//! outcomes and connection-state changes.
//!
//! Adapters are a closed set dispatched by match, not trait objects; the
//! per-tick cost stays predictable at large populations.

mod coap;
mod http;
mod mqtt;

pub use coap::{CoapAdapter, CoapEndpoint};
pub use http::{HttpAdapter, HttpEndpoint};
pub use mqtt::{MqttAdapter, MqttEndpoint};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, mpsc, watch};

use domain::device::ConnectionState;
use domain::error::Result;
use domain::metrics::FieldValue;

/// One pending publish. `topic` is only meaningful for MQTT; CoAP and HTTP
/// post to the endpoint they were built with. `value` is the generated
/// scalar, echoed back in the outcome so the device can emit its telemetry
/// point without re-parsing the payload.
#[derive(Debug, Clone)]
pub struct Publish {
    pub attribute: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub binary: bool,
    pub value: Option<FieldValue>,
}

/// Result of one publish attempt, reported back to the owning device.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub attribute: String,
    pub bytes: usize,
    pub success: bool,
    pub value: Option<FieldValue>,
}

/// Bounded submit queue between the device's attribute tasks and the
/// adapter worker. Submission never blocks: when full, the oldest entry is
/// dropped and counted.
pub(crate) struct PublishQueue {
    inner: Mutex<VecDeque<Publish>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl PublishQueue {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        })
    }

    pub(crate) fn push(&self, item: Publish) {
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
    }

    pub(crate) async fn pop(&self) -> Publish {
        loop {
            // Arm the waiter before checking so a push between the check
            // and the await cannot be lost.
            let notified = self.notify.notified();
            if let Some(item) = self.inner.lock().unwrap().pop_front() {
                return item;
            }
            notified.await;
        }
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Tagged egress adapter. The capability set is connect / submit / close
/// plus connection-state observation.
pub enum ProtocolAdapter {
    Mqtt(MqttAdapter),
    Coap(CoapAdapter),
    Http(HttpAdapter),
}

impl ProtocolAdapter {
    /// Establishes (or begins establishing) the link and starts the
    /// adapter's worker tasks. The caller observes `watch_state()` to wait
    /// for `Connected` under its own timeout.
    pub async fn connect(&mut self) -> Result<()> {
        match self {
            Self::Mqtt(a) => a.connect().await,
            Self::Coap(a) => a.connect().await,
            Self::Http(a) => a.connect().await,
        }
    }

    /// Non-blocking publish submission (bounded, drop-oldest).
    pub fn submit(&self, publish: Publish) {
        match self {
            Self::Mqtt(a) => a.submit(publish),
            Self::Coap(a) => a.submit(publish),
            Self::Http(a) => a.submit(publish),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.watch_state().borrow()
    }

    pub fn watch_state(&self) -> &watch::Receiver<ConnectionState> {
        match self {
            Self::Mqtt(a) => a.watch_state(),
            Self::Coap(a) => a.watch_state(),
            Self::Http(a) => a.watch_state(),
        }
    }

    pub fn dropped_publishes(&self) -> u64 {
        match self {
            Self::Mqtt(a) => a.dropped_publishes(),
            Self::Coap(a) => a.dropped_publishes(),
            Self::Http(a) => a.dropped_publishes(),
        }
    }

    /// Tears the link down and stops the worker tasks.
    pub async fn close(&mut self) {
        match self {
            Self::Mqtt(a) => a.close().await,
            Self::Coap(a) => a.close().await,
            Self::Http(a) => a.close().await,
        }
    }

    /// Simulates a dropped link for dropout orchestration: the adapter is
    /// torn down but the connection state reads `Reconnecting`.
    pub async fn sever(&mut self) {
        match self {
            Self::Mqtt(a) => a.sever().await,
            Self::Coap(a) => a.sever().await,
            Self::Http(a) => a.sever().await,
        }
    }
}

/// Cloneable submit handle for a device's attribute tasks. The adapter
/// itself stays uniquely owned by the device supervisor.
#[derive(Clone)]
pub struct PublishHandle {
    queue: Arc<PublishQueue>,
}

impl PublishHandle {
    pub fn submit(&self, publish: Publish) {
        self.queue.push(publish);
    }

    pub fn dropped_publishes(&self) -> u64 {
        self.queue.dropped()
    }
}

impl ProtocolAdapter {
    pub fn publish_handle(&self) -> PublishHandle {
        let queue = match self {
            Self::Mqtt(a) => a.queue_handle(),
            Self::Coap(a) => a.queue_handle(),
            Self::Http(a) => a.queue_handle(),
        };
        PublishHandle { queue }
    }
}

pub(crate) type OutcomeSender = mpsc::Sender<PublishOutcome>;

pub(crate) fn report_outcome(
    tx: &OutcomeSender,
    attribute: String,
    bytes: usize,
    success: bool,
    value: Option<FieldValue>,
) {
    // The device drains this channel continuously; if it ever lags we
    // prefer losing an outcome report over blocking the adapter worker.
    let _ = tx.try_send(PublishOutcome {
        attribute,
        bytes,
        success,
        value,
    });
}
