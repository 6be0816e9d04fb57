use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Ingress protocol of a proxy binding. CoAP ingress is not offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingProtocol {
    Mqtt,
    Http,
}

/// Association between a proxy device and its external telemetry source.
/// At most one active binding per device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingConfig {
    pub protocol: BindingProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub qos: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_ref: Option<String>,
    /// Server-assigned for http bindings; never client-supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_path: Option<String>,
}

impl BindingConfig {
    pub fn validate(&self) -> Result<()> {
        match self.protocol {
            BindingProtocol::Mqtt => {
                if self.broker.as_deref().is_none_or(str::is_empty) {
                    return Err(EngineError::Validation(
                        "mqtt binding requires a broker".to_string(),
                    ));
                }
                if self.port.is_none_or(|p| p == 0) {
                    return Err(EngineError::Validation(
                        "mqtt binding requires a port in 1..=65535".to_string(),
                    ));
                }
                if self.topic.as_deref().is_none_or(str::is_empty) {
                    return Err(EngineError::Validation(
                        "mqtt binding requires a topic".to_string(),
                    ));
                }
                if self.qos > 2 {
                    return Err(EngineError::Validation(
                        "qos must be 0, 1 or 2".to_string(),
                    ));
                }
                Ok(())
            }
            BindingProtocol::Http => Ok(()),
        }
    }
}
