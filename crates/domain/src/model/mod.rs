mod generator;

pub use generator::{Distribution, GeneratorSpec, ReplayFormat};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::Source;
use crate::error::{EngineError, Result};

/// Kind of device a model describes. `Proxy` models produce physical
/// passthrough devices; every other kind produces simulated devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Sensor,
    Gateway,
    Actuator,
    Custom,
    Proxy,
}

impl ModelType {
    pub fn is_proxy(&self) -> bool {
        matches!(self, Self::Proxy)
    }

    /// The source tag every datum from an instance of this model carries.
    pub fn source(&self) -> Source {
        if self.is_proxy() {
            Source::Physical
        } else {
            Source::Simulated
        }
    }
}

/// Egress protocol of a model's devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Mqtt,
    Coap,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Coap => "coap",
            Self::Http => "http",
        }
    }
}

/// Data type of a telemetry attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Number,
    Integer,
    Boolean,
    String,
    Binary,
}

impl DataType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Number | Self::Integer)
    }
}

/// Broker / endpoint settings shared by all devices of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSpec {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub qos: u8,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    /// Pattern for the MQTT client id; `{modelId}-{deviceId}` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_pattern: Option<String>,
    /// Pattern for the publish topic, interpolated per device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_pattern: Option<String>,
    /// CoAP resource the device POSTs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_path: Option<String>,
    /// Path appended to the HTTP base URL on publish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_ref: Option<String>,
}

fn default_host() -> String {
    // Empty means "use the engine's configured default broker".
    String::new()
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u16 {
    60
}

impl Default for ConnectionSpec {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            qos: 0,
            keepalive_secs: default_keepalive(),
            client_id_pattern: None,
            topic_pattern: None,
            resource_path: None,
            base_path: None,
            username: None,
            password_ref: None,
        }
    }
}

impl ConnectionSpec {
    pub const DEFAULT_TOPIC_PATTERN: &'static str = "devices/${deviceId}/telemetry";
    pub const DEFAULT_CLIENT_ID_PATTERN: &'static str = "${modelId}-${deviceId}";
    pub const DEFAULT_RESOURCE_PATH: &'static str = "/telemetry";

    pub fn topic_pattern(&self) -> &str {
        self.topic_pattern
            .as_deref()
            .unwrap_or(Self::DEFAULT_TOPIC_PATTERN)
    }

    pub fn client_id_pattern(&self) -> &str {
        self.client_id_pattern
            .as_deref()
            .unwrap_or(Self::DEFAULT_CLIENT_ID_PATTERN)
    }

    pub fn resource_path(&self) -> &str {
        self.resource_path
            .as_deref()
            .unwrap_or(Self::DEFAULT_RESOURCE_PATH)
    }

    /// Broker host, falling back to the engine default when the model
    /// leaves it unset.
    pub fn host_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.host.is_empty() {
            fallback
        } else {
            &self.host
        }
    }
}

/// One telemetry attribute: a named value stream with its own generator
/// and its own publish interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub generator: GeneratorSpec,
    pub interval_ms: u64,
}

/// A registered device model. Immutable while any device references it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub protocol: Protocol,
    #[serde(default)]
    pub connection: ConnectionSpec,
    #[serde(default)]
    pub telemetry: Vec<AttributeSpec>,
    // Carried through for consumers; not on the engine's hot path.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub commands: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub behaviors: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl DeviceModel {
    /// Validates the full model spec at registration time.
    pub fn validate(&self) -> Result<()> {
        validate_model_id(&self.id)?;

        if self.connection.port == 0 {
            return Err(EngineError::Validation(format!(
                "model {}: port must be in 1..=65535",
                self.id
            )));
        }
        if self.connection.qos > 2 {
            return Err(EngineError::Validation(format!(
                "model {}: qos must be 0, 1 or 2",
                self.id
            )));
        }

        if self.model_type.is_proxy() {
            if !self.telemetry.is_empty() {
                return Err(EngineError::Validation(format!(
                    "proxy model {} must not declare telemetry attributes",
                    self.id
                )));
            }
            if self.protocol == Protocol::Coap {
                return Err(EngineError::Validation(format!(
                    "proxy model {}: protocol must be mqtt or http",
                    self.id
                )));
            }
            return Ok(());
        }

        let mut seen = std::collections::HashSet::new();
        for attr in &self.telemetry {
            if attr.name.is_empty() {
                return Err(EngineError::Validation(format!(
                    "model {}: attribute name cannot be empty",
                    self.id
                )));
            }
            if !seen.insert(attr.name.as_str()) {
                return Err(EngineError::Validation(format!(
                    "model {}: duplicate attribute {}",
                    self.id, attr.name
                )));
            }
            if attr.interval_ms < 1 {
                return Err(EngineError::Validation(format!(
                    "model {}: attribute {}: intervalMs must be >= 1",
                    self.id, attr.name
                )));
            }
            attr.generator
                .validate(attr.data_type)
                .map_err(|e| match e {
                    EngineError::Validation(msg) => EngineError::Validation(format!(
                        "model {}: attribute {}: {}",
                        self.id, attr.name, msg
                    )),
                    other => other,
                })?;
        }

        Ok(())
    }

    pub fn source(&self) -> Source {
        self.model_type.source()
    }
}

/// Model ids are lowercase kebab: `^[a-z][a-z0-9-]*$`.
pub fn validate_model_id(id: &str) -> Result<()> {
    let mut chars = id.chars();
    let valid = match chars.next() {
        Some(first) => {
            first.is_ascii_lowercase()
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(EngineError::Validation(format!(
            "model id {:?} must match ^[a-z][a-z0-9-]*$",
            id
        )))
    }
}
