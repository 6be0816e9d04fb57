mod binding;
mod connection_state;
mod status;

pub use binding::{BindingConfig, BindingProtocol};
pub use connection_state::ConnectionState;
pub use status::DeviceStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Origin of a device's telemetry. Every emitted point carries this tag so
/// mixed populations stay distinguishable downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Simulated,
    Physical,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simulated => "simulated",
            Self::Physical => "physical",
        }
    }
}

/// Immutable identity of a device in the catalog. Runtime state (status,
/// link state, counters) lives with the device's tasks; this record never
/// changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub source: Source,
    pub created_at: DateTime<Utc>,
}

impl Device {
    pub fn new(
        id: String,
        model_id: String,
        group_id: Option<String>,
        source: Source,
    ) -> Self {
        Self {
            id,
            model_id,
            group_id,
            source,
            created_at: Utc::now(),
        }
    }
}

/// Point-in-time view of a device served by the control plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub id: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub source: Source,
    pub status: DeviceStatus,
    pub connection_state: ConnectionState,
    pub messages_sent: u64,
    pub bytes_sent: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_received: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_telemetry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<BindingConfig>,
}

/// Device ids are free-form but must stay path- and topic-safe.
pub fn validate_device_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(EngineError::Validation(
            "device id cannot be empty".to_string(),
        ));
    }
    if id.len() > 128 {
        return Err(EngineError::Validation(format!(
            "device id too long: {} chars (max 128)",
            id.len()
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(EngineError::Validation(format!(
            "device id {:?} may contain only alphanumeric, '-', '_' and '.'",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_as_str() {
        assert_eq!(Source::Simulated.as_str(), "simulated");
        assert_eq!(Source::Physical.as_str(), "physical");
    }

    #[test]
    fn test_device_record_is_immutable_identity() {
        let device = Device::new(
            "t1-0".to_string(),
            "t1".to_string(),
            Some("G".to_string()),
            Source::Simulated,
        );
        assert_eq!(device.id, "t1-0");
        assert_eq!(device.model_id, "t1");
        assert_eq!(device.group_id.as_deref(), Some("G"));
    }

    #[test]
    fn test_device_id_rules() {
        assert!(validate_device_id("t1-0").is_ok());
        assert!(validate_device_id("x_7.b").is_ok());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("a/b").is_err());
        assert!(validate_device_id(&"a".repeat(129)).is_err());
    }
}
