use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing discipline for starting a group's members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LaunchStrategy {
    #[default]
    Immediate,
    Linear,
    Batch,
    Exponential,
}

/// Group launch configuration. Members are ordered by ascending device id;
/// member `i` starts `offset(i)` after the launch epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchConfig {
    pub strategy: LaunchStrategy,
    /// Per-step delay; 0 for immediate, 1000ms for staged strategies when
    /// not supplied.
    pub delay_ms: Option<u64>,
    pub batch_size: usize,
    pub max_delay_ms: u64,
    pub exponent_base: f64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            strategy: LaunchStrategy::Immediate,
            delay_ms: None,
            batch_size: 100,
            max_delay_ms: 60_000,
            exponent_base: 1.5,
        }
    }
}

impl LaunchConfig {
    const DEFAULT_STAGED_DELAY_MS: u64 = 1_000;

    fn delay_ms(&self) -> u64 {
        self.delay_ms.unwrap_or(match self.strategy {
            LaunchStrategy::Immediate => 0,
            _ => Self::DEFAULT_STAGED_DELAY_MS,
        })
    }

    /// Start-time offset from the launch epoch for member index `i`.
    pub fn offset(&self, index: usize) -> Duration {
        let delay = self.delay_ms();
        let ms = match self.strategy {
            LaunchStrategy::Immediate => 0,
            LaunchStrategy::Linear => index as u64 * delay,
            LaunchStrategy::Batch => {
                let batch = self.batch_size.max(1);
                (index / batch) as u64 * delay
            }
            LaunchStrategy::Exponential => {
                let raw = delay as f64 * self.exponent_base.powi(index as i32);
                raw.min(self.max_delay_ms as f64).max(0.0) as u64
            }
        };
        Duration::from_millis(ms)
    }

    /// Offset of the last member; reported back to the caller as the
    /// estimated launch duration.
    pub fn estimated_duration_ms(&self, count: usize) -> u64 {
        match count {
            0 => 0,
            n => self.offset(n - 1).as_millis() as u64,
        }
    }
}
