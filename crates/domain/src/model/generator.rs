use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DataType;
use crate::error::{EngineError, Result};

/// Sampling distribution for the random generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    #[default]
    Uniform,
    Normal,
    Exponential,
}

/// On-disk format of a replay trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplayFormat {
    #[default]
    Csv,
    Jsonl,
}

/// How a telemetry attribute produces values. Closed set; no plugin
/// registry on the hot path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GeneratorSpec {
    Random {
        #[serde(default)]
        distribution: Distribution,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mean: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stddev: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rate: Option<f64>,
        /// Decimal places for number attributes; 2 when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        precision: Option<u32>,
    },
    Sequence {
        #[serde(default)]
        start: f64,
        #[serde(default = "default_step")]
        step: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(default)]
        wrap: bool,
    },
    Constant {
        value: Value,
    },
    Replay {
        path: String,
        #[serde(default)]
        format: ReplayFormat,
        column: String,
        #[serde(default, rename = "loop")]
        looped: bool,
    },
    Custom {
        handler: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        config: Value,
    },
}

fn default_step() -> f64 {
    1.0
}

impl GeneratorSpec {
    /// Checks the spec against its variant rules and the attribute's
    /// declared data type.
    pub fn validate(&self, data_type: DataType) -> Result<()> {
        match self {
            Self::Random {
                distribution,
                min,
                max,
                mean,
                stddev,
                rate,
                ..
            } => {
                if !data_type.is_numeric() {
                    return Err(validation("random generator requires a numeric attribute"));
                }
                if let (Some(lo), Some(hi)) = (min, max) {
                    if lo > hi {
                        return Err(validation("min must not exceed max"));
                    }
                }
                match distribution {
                    Distribution::Uniform => {
                        if min.is_none() || max.is_none() {
                            return Err(validation("uniform distribution requires min and max"));
                        }
                    }
                    Distribution::Normal => {
                        if mean.is_none() || stddev.is_none() {
                            return Err(validation("normal distribution requires mean and stddev"));
                        }
                        if stddev.is_some_and(|s| s <= 0.0) {
                            return Err(validation("stddev must be positive"));
                        }
                    }
                    Distribution::Exponential => {
                        let lambda_ok = rate.is_some_and(|r| r > 0.0)
                            || (rate.is_none() && mean.is_some_and(|m| m > 0.0));
                        if !lambda_ok {
                            return Err(validation(
                                "exponential distribution requires a positive mean or rate",
                            ));
                        }
                    }
                }
                Ok(())
            }
            Self::Sequence {
                step, min, max, ..
            } => {
                if !data_type.is_numeric() {
                    return Err(validation("sequence generator requires a numeric attribute"));
                }
                if *step == 0.0 {
                    return Err(validation("sequence step must be non-zero"));
                }
                if let (Some(lo), Some(hi)) = (min, max) {
                    if lo > hi {
                        return Err(validation("min must not exceed max"));
                    }
                }
                Ok(())
            }
            Self::Constant { value } => {
                let matches = match data_type {
                    DataType::Number | DataType::Integer => value.is_number(),
                    DataType::Boolean => value.is_boolean(),
                    DataType::String => value.is_string(),
                    // binary constants are text whose bytes get published
                    DataType::Binary => value.is_string(),
                };
                if matches {
                    Ok(())
                } else {
                    Err(validation("constant value does not match attribute type"))
                }
            }
            Self::Replay { path, column, .. } => {
                if path.is_empty() {
                    return Err(validation("replay path cannot be empty"));
                }
                if column.is_empty() {
                    return Err(validation("replay column cannot be empty"));
                }
                Ok(())
            }
            Self::Custom { handler, .. } => {
                if handler.is_empty() {
                    Err(validation("custom handler name cannot be empty"))
                } else {
                    Ok(())
                }
            }
        }
    }
}

fn validation(msg: &str) -> EngineError {
    EngineError::Validation(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uniform_requires_bounds() {
        let spec: GeneratorSpec =
            serde_json::from_value(json!({"type": "random", "min": 0.0, "max": 10.0})).unwrap();
        assert!(spec.validate(DataType::Number).is_ok());

        let spec: GeneratorSpec = serde_json::from_value(json!({"type": "random"})).unwrap();
        assert!(spec.validate(DataType::Number).is_err());
    }

    #[test]
    fn test_random_rejects_non_numeric() {
        let spec: GeneratorSpec =
            serde_json::from_value(json!({"type": "random", "min": 0.0, "max": 1.0})).unwrap();
        assert!(spec.validate(DataType::String).is_err());
    }

    #[test]
    fn test_normal_requires_mean_and_stddev() {
        let spec: GeneratorSpec = serde_json::from_value(
            json!({"type": "random", "distribution": "normal", "mean": 5.0, "stddev": 1.0}),
        )
        .unwrap();
        assert!(spec.validate(DataType::Number).is_ok());

        let spec: GeneratorSpec = serde_json::from_value(
            json!({"type": "random", "distribution": "normal", "mean": 5.0}),
        )
        .unwrap();
        assert!(spec.validate(DataType::Number).is_err());
    }

    #[test]
    fn test_exponential_accepts_rate_or_mean() {
        let by_rate: GeneratorSpec = serde_json::from_value(
            json!({"type": "random", "distribution": "exponential", "rate": 0.5}),
        )
        .unwrap();
        assert!(by_rate.validate(DataType::Number).is_ok());

        let by_mean: GeneratorSpec = serde_json::from_value(
            json!({"type": "random", "distribution": "exponential", "mean": 2.0}),
        )
        .unwrap();
        assert!(by_mean.validate(DataType::Number).is_ok());
    }

    #[test]
    fn test_sequence_step_must_be_nonzero() {
        let spec: GeneratorSpec =
            serde_json::from_value(json!({"type": "sequence", "start": 0.0, "step": 0.0})).unwrap();
        assert!(spec.validate(DataType::Integer).is_err());
    }

    #[test]
    fn test_constant_type_check() {
        let spec: GeneratorSpec =
            serde_json::from_value(json!({"type": "constant", "value": true})).unwrap();
        assert!(spec.validate(DataType::Boolean).is_ok());
        assert!(spec.validate(DataType::Number).is_err());
    }

    #[test]
    fn test_replay_loop_field_name() {
        let spec: GeneratorSpec = serde_json::from_value(
            json!({"type": "replay", "path": "trace.csv", "column": "temp", "loop": true}),
        )
        .unwrap();
        match spec {
            GeneratorSpec::Replay { looped, format, .. } => {
                assert!(looped);
                assert_eq!(format, ReplayFormat::Csv);
            }
            _ => panic!("wrong variant"),
        }
    }
}
