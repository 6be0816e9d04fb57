use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Fallback broker endpoint for models that omit a host.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct BrokerDefaults {
    pub host: String,
    pub port: u16,
}

impl Default for BrokerDefaults {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
        }
    }
}

/// Time-series sink endpoint and batching knobs. With no URL configured
/// the sink runs in discard mode (useful for local development).
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SinkConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub batch_size: usize,
    pub buffer_capacity: usize,
    pub flush_interval_ms: u64,
    pub shutdown_flush_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            batch_size: 5_000,
            buffer_capacity: 100_000,
            flush_interval_ms: 1_000,
            shutdown_flush_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EngineLimits {
    pub max_group_size: usize,
    pub publish_queue_capacity: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_group_size: 1_000_000,
            publish_queue_capacity: 1_024,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct EngineTimeouts {
    pub connect_ms: u64,
    pub publish_ms: u64,
    pub graceful_stop_ms: u64,
    pub stats_interval_secs: u64,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            publish_ms: 5_000,
            graceful_stop_ms: 5_000,
            stats_interval_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub api: ApiConfig,
    pub model_dir: Option<String>,
    pub broker: BrokerDefaults,
    pub sink: SinkConfig,
    pub limits: EngineLimits,
    pub timeouts: EngineTimeouts,
}

impl EngineConfig {
    /// Layered load: built-in defaults, optional `<dir>/default.toml`,
    /// optional `<dir>/<RUN_MODE>.toml`, then `ENGINE__*` environment
    /// variables (e.g. `ENGINE__SINK__URL=http://tsdb:8086/write`).
    /// `DEVICE_MODEL_PATH` always wins for the model directory.
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            .add_source(
                Environment::with_prefix("ENGINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: EngineConfig = s.try_deserialize()?;

        if let Ok(dir) = std::env::var("DEVICE_MODEL_PATH") {
            cfg.model_dir = Some(dir);
        }

        Ok(cfg)
    }

    /// The model directory, defaulting to `./models`.
    pub fn model_dir(&self) -> &str {
        self.model_dir.as_deref().unwrap_or("models")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.api.port, 8080);
        assert_eq!(cfg.sink.batch_size, 5_000);
        assert_eq!(cfg.sink.buffer_capacity, 100_000);
        assert_eq!(cfg.limits.max_group_size, 1_000_000);
        assert_eq!(cfg.limits.publish_queue_capacity, 1_024);
        assert_eq!(cfg.timeouts.connect_ms, 10_000);
        assert_eq!(cfg.model_dir(), "models");
    }

    #[test]
    fn test_load_without_files_uses_defaults() {
        let cfg = EngineConfig::load("does-not-exist").unwrap();
        assert_eq!(cfg.api.host, "0.0.0.0");
        assert_eq!(cfg.timeouts.stats_interval_secs, 5);
    }
}
