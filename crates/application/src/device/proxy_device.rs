use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tracing::debug;

use domain::device::Device;
use domain::error::{EngineError, Result};
use domain::metrics::{FieldValue, Point};

use infrastructure::sink::MetricsSink;

use super::DeviceRuntime;

/// Passthrough unit for one bound proxy device: counts what arrives and
/// fans the payload's scalar fields into a `telemetry` point tagged
/// `source=physical`. No scheduler of its own.
pub struct ProxyDevice {
    record: Device,
    runtime: Arc<DeviceRuntime>,
    sink: Arc<MetricsSink>,
}

impl ProxyDevice {
    pub fn new(record: Device, runtime: Arc<DeviceRuntime>, sink: Arc<MetricsSink>) -> Arc<Self> {
        Arc::new(Self {
            record,
            runtime,
            sink,
        })
    }

    pub fn record(&self) -> &Device {
        &self.record
    }

    /// Entry point for MQTT ingress: raw broker payloads. Non-JSON and
    /// non-object payloads are dropped and counted.
    pub fn ingest_bytes(&self, payload: &[u8]) {
        match serde_json::from_slice::<Value>(payload) {
            Ok(value) if value.is_object() => {
                self.write_point(payload.len(), &value);
            }
            _ => {
                self.runtime.dropped_payloads.fetch_add(1, Ordering::Relaxed);
                debug!(device_id = %self.record.id, "Dropped non-JSON proxy payload");
            }
        }
    }

    /// Entry point for the webhook route: an already-parsed body. The
    /// caller surfaces the validation error as a 400.
    pub fn ingest_json(&self, value: &Value) -> Result<()> {
        if !value.is_object() {
            self.runtime.dropped_payloads.fetch_add(1, Ordering::Relaxed);
            return Err(EngineError::Validation(
                "webhook body must be a JSON object".to_string(),
            ));
        }
        let size = serde_json::to_vec(value).map(|b| b.len()).unwrap_or(0);
        self.write_point(size, value);
        Ok(())
    }

    fn write_point(&self, size: usize, value: &Value) {
        self.runtime.mark_received(size);

        let mut point = Point::telemetry(
            &self.record.id,
            &self.record.model_id,
            self.record.group_id.as_deref(),
            self.record.source,
        );
        let mut fields = 0usize;
        if let Some(map) = value.as_object() {
            for (key, field_value) in map {
                if let Some(field) = FieldValue::from_json(field_value) {
                    point = point.field(key.clone(), field);
                    fields += 1;
                }
            }
        }
        // nothing usable in the payload, nothing to write
        if fields > 0 {
            self.sink.submit(point);
        }
    }
}
