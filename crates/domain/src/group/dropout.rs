use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Timing discipline for programmed failures within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DropoutStrategy {
    #[default]
    Immediate,
    Linear,
    Exponential,
    Random,
}

/// Dropout configuration: which running simulated members get their link
/// torn down, and when. Proxy members are never selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DropoutConfig {
    pub strategy: DropoutStrategy,
    pub count: Option<usize>,
    pub percentage: Option<f64>,
    pub delay_ms: u64,
    pub exponent_base: f64,
    pub max_delay_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub reconnect: bool,
    pub reconnect_delay_ms: u64,
}

impl Default for DropoutConfig {
    fn default() -> Self {
        Self {
            strategy: DropoutStrategy::Immediate,
            count: None,
            percentage: None,
            delay_ms: 1_000,
            exponent_base: 1.5,
            max_delay_ms: None,
            duration_ms: None,
            reconnect: false,
            reconnect_delay_ms: 1_000,
        }
    }
}

impl DropoutConfig {
    pub fn validate(&self) -> Result<()> {
        if self.count.is_none() && self.percentage.is_none() {
            return Err(EngineError::Validation(
                "dropout requires count or percentage".to_string(),
            ));
        }
        if let Some(p) = self.percentage {
            if !(0.0..=100.0).contains(&p) {
                return Err(EngineError::Validation(
                    "percentage must be in 0..=100".to_string(),
                ));
            }
        }
        if self.strategy == DropoutStrategy::Random && self.duration_ms.is_none() {
            return Err(EngineError::Validation(
                "random dropout requires durationMs".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of members to disconnect given the running simulated
    /// population. `count` wins over `percentage` when both are present.
    pub fn target_count(&self, running: usize) -> usize {
        if let Some(count) = self.count {
            count.min(running)
        } else if let Some(pct) = self.percentage {
            ((pct / 100.0) * running as f64).floor() as usize
        } else {
            0
        }
    }

    /// Disconnect offset for the k-th selected device. `None` for the
    /// random strategy, whose times are sampled rather than computed.
    pub fn offset(&self, k: usize) -> Option<Duration> {
        let ms = match self.strategy {
            DropoutStrategy::Immediate => 0,
            DropoutStrategy::Linear => k as u64 * self.delay_ms,
            DropoutStrategy::Exponential => {
                let raw = self.delay_ms as f64 * self.exponent_base.powi(k as i32);
                // durationMs caps the schedule when present, else uncapped
                let cap = self
                    .max_delay_ms
                    .or(self.duration_ms)
                    .map(|c| c as f64)
                    .unwrap_or(f64::INFINITY);
                raw.min(cap) as u64
            }
            DropoutStrategy::Random => return None,
        };
        Some(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requires_count_or_percentage() {
        let cfg = DropoutConfig::default();
        assert!(cfg.validate().is_err());

        let cfg = DropoutConfig {
            count: Some(3),
            ..DropoutConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_count_is_clamped_to_running() {
        let cfg = DropoutConfig {
            count: Some(10),
            ..DropoutConfig::default()
        };
        assert_eq!(cfg.target_count(4), 4);
        assert_eq!(cfg.target_count(20), 10);
    }

    #[test]
    fn test_percentage_floors() {
        let cfg = DropoutConfig {
            percentage: Some(50.0),
            ..DropoutConfig::default()
        };
        assert_eq!(cfg.target_count(10), 5);
        assert_eq!(cfg.target_count(5), 2);
        assert_eq!(cfg.target_count(0), 0);
    }

    #[test]
    fn test_linear_schedule() {
        let cfg = DropoutConfig {
            strategy: DropoutStrategy::Linear,
            delay_ms: 100,
            count: Some(3),
            ..DropoutConfig::default()
        };
        assert_eq!(cfg.offset(0).unwrap().as_millis(), 0);
        assert_eq!(cfg.offset(2).unwrap().as_millis(), 200);
    }

    #[test]
    fn test_exponential_capped_by_duration() {
        let cfg = DropoutConfig {
            strategy: DropoutStrategy::Exponential,
            delay_ms: 1_000,
            exponent_base: 2.0,
            duration_ms: Some(3_000),
            count: Some(5),
            ..DropoutConfig::default()
        };
        assert_eq!(cfg.offset(0).unwrap().as_millis(), 1_000);
        assert_eq!(cfg.offset(1).unwrap().as_millis(), 2_000);
        assert_eq!(cfg.offset(5).unwrap().as_millis(), 3_000);
    }

    #[test]
    fn test_random_requires_duration() {
        let cfg: DropoutConfig = serde_json::from_value(json!({
            "strategy": "random",
            "percentage": 25.0
        }))
        .unwrap();
        assert!(cfg.validate().is_err());

        let cfg: DropoutConfig = serde_json::from_value(json!({
            "strategy": "random",
            "percentage": 25.0,
            "durationMs": 0
        }))
        .unwrap();
        assert!(cfg.validate().is_ok());
        assert!(cfg.offset(0).is_none());
    }

    #[test]
    fn test_reconnect_defaults() {
        let cfg: DropoutConfig = serde_json::from_value(json!({
            "strategy": "immediate",
            "percentage": 50.0,
            "reconnect": true,
            "reconnectDelayMs": 500
        }))
        .unwrap();
        assert!(cfg.reconnect);
        assert_eq!(cfg.reconnect_delay_ms, 500);
    }
}
