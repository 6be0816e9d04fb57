use chrono::Utc;
use serde_json::Value;

use crate::device::Source;
use crate::event::LifecycleEvent;
use crate::model::Protocol;

/// A typed field value on a time-series point.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    Text(String),
}

impl FieldValue {
    /// Maps a JSON scalar onto a field value. Objects, arrays and null
    /// have no field representation.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self::Integer(i))
                } else {
                    n.as_f64().map(Self::Float)
                }
            }
            Value::Bool(b) => Some(Self::Boolean(*b)),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// One tagged time-series point bound for the sink. Timestamps are
/// nanoseconds since epoch at emission.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: &'static str,
    pub tags: Vec<(String, String)>,
    pub fields: Vec<(String, FieldValue)>,
    pub timestamp_ns: i64,
}

impl Point {
    pub fn new(measurement: &'static str) -> Self {
        Self {
            measurement,
            tags: Vec::new(),
            fields: Vec::new(),
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// One `telemetry` point per publish or receive. The `source` tag is
    /// mandatory so mixed populations stay distinguishable.
    pub fn telemetry(
        device_id: &str,
        model_id: &str,
        group_id: Option<&str>,
        source: Source,
    ) -> Self {
        let mut point = Self::new("telemetry")
            .tag("deviceId", device_id)
            .tag("modelId", model_id);
        if let Some(group) = group_id {
            point = point.tag("groupId", group);
        }
        point.tag("source", source.as_str())
    }

    /// One `device_events` point per lifecycle transition.
    pub fn device_event(
        device_id: &str,
        model_id: &str,
        group_id: Option<&str>,
        source: Source,
        event: LifecycleEvent,
    ) -> Self {
        let mut point = Self::new("device_events")
            .tag("deviceId", device_id)
            .tag("modelId", model_id)
            .tag("eventType", event.as_str());
        if let Some(group) = group_id {
            point = point.tag("groupId", group);
        }
        point.tag("source", source.as_str()).field("value", 1i64)
    }

    /// One `connections` point per link state change.
    pub fn connection(
        device_id: &str,
        protocol: Protocol,
        source: Source,
        connected: bool,
        latency_ms: f64,
    ) -> Self {
        Self::new("connections")
            .tag("deviceId", device_id)
            .tag("protocol", protocol.as_str())
            .tag("source", source.as_str())
            .field("connected", connected)
            .field("latencyMs", latency_ms)
    }

    /// The periodic `engine_stats` point; untagged.
    pub fn engine_stats(
        active_devices: u64,
        active_simulated: u64,
        active_physical: u64,
        total_messages: u64,
        total_bytes: u64,
        active_groups: u64,
    ) -> Self {
        Self::new("engine_stats")
            .field("activeDevices", active_devices)
            .field("activeSimulated", active_simulated)
            .field("activePhysical", active_physical)
            .field("totalMessages", total_messages)
            .field("totalBytes", total_bytes)
            .field("activeGroups", active_groups)
    }
}
