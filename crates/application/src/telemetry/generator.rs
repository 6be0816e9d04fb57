use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution as SampleDistribution, Exp, Normal};
use serde_json::{Value, json};

use domain::error::{EngineError, Result};
use domain::model::{DataType, Distribution, GeneratorSpec};

use super::registry::{HandlerFn, HandlerRegistry};
use super::replay::ReplayGenerator;

const DEFAULT_PRECISION: u32 = 2;

/// A produced telemetry value: JSON for everything except binary
/// attributes, which publish raw bytes with no framing.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratedValue {
    Json(Value),
    Bytes(Vec<u8>),
}

/// Stateful value producer for one attribute of one device. Closed set of
/// variants; the per-tick path is a match, not a virtual call.
#[derive(Debug)]
pub enum Generator {
    Random(RandomGenerator),
    Sequence(SequenceGenerator),
    Constant(ConstantGenerator),
    Replay(ReplayGenerator),
    Custom(CustomGenerator),
}

impl Generator {
    /// Builds generator state at device start. The random seed derives
    /// from `(deviceId, attrName)` so runs are reproducible.
    pub fn build(
        spec: &GeneratorSpec,
        data_type: DataType,
        device_id: &str,
        attribute: &str,
        registry: &HandlerRegistry,
    ) -> Result<Self> {
        match spec {
            GeneratorSpec::Random {
                distribution,
                min,
                max,
                mean,
                stddev,
                rate,
                precision,
            } => Ok(Self::Random(RandomGenerator {
                rng: StdRng::seed_from_u64(attribute_seed(device_id, attribute)),
                distribution: *distribution,
                min: *min,
                max: *max,
                mean: *mean,
                stddev: *stddev,
                rate: *rate,
                precision: precision.unwrap_or(DEFAULT_PRECISION),
                integer: data_type == DataType::Integer,
            })),
            GeneratorSpec::Sequence {
                start,
                step,
                min,
                max,
                wrap,
            } => Ok(Self::Sequence(SequenceGenerator {
                value: *start,
                step: *step,
                min: *min,
                max: *max,
                wrap: *wrap,
                exhausted: false,
                integer: data_type == DataType::Integer,
            })),
            GeneratorSpec::Constant { value } => Ok(Self::Constant(ConstantGenerator {
                value: value.clone(),
                binary: data_type == DataType::Binary,
            })),
            GeneratorSpec::Replay {
                path,
                format,
                column,
                looped,
            } => Ok(Self::Replay(ReplayGenerator::load(
                path, *format, column, *looped,
            )?)),
            GeneratorSpec::Custom { handler, config } => {
                let handler_fn = registry.get(handler).ok_or_else(|| {
                    EngineError::Validation(format!("unknown custom handler: {handler}"))
                })?;
                Ok(Self::Custom(CustomGenerator {
                    handler: handler_fn,
                    device_id: device_id.to_string(),
                    attribute: attribute.to_string(),
                    config: config.clone(),
                }))
            }
        }
    }

    pub fn next_value(&mut self, now: DateTime<Utc>) -> GeneratedValue {
        match self {
            Self::Random(g) => g.next_value(),
            Self::Sequence(g) => g.next_value(),
            Self::Constant(g) => g.next_value(),
            Self::Replay(g) => g.next_value(),
            Self::Custom(g) => (g.handler)(&g.device_id, &g.attribute, &g.config, now),
        }
    }
}

#[derive(Debug)]
pub struct RandomGenerator {
    rng: StdRng,
    distribution: Distribution,
    min: Option<f64>,
    max: Option<f64>,
    mean: Option<f64>,
    stddev: Option<f64>,
    rate: Option<f64>,
    precision: u32,
    integer: bool,
}

impl RandomGenerator {
    fn next_value(&mut self) -> GeneratedValue {
        let raw = match self.distribution {
            Distribution::Uniform => {
                let lo = self.min.unwrap_or(0.0);
                let hi = self.max.unwrap_or(1.0);
                if lo == hi {
                    lo
                } else {
                    self.rng.gen_range(lo..=hi)
                }
            }
            Distribution::Normal => {
                let mean = self.mean.unwrap_or(0.0);
                let stddev = self.stddev.unwrap_or(1.0);
                match Normal::new(mean, stddev) {
                    Ok(normal) => normal.sample(&mut self.rng),
                    Err(_) => mean,
                }
            }
            Distribution::Exponential => {
                let lambda = self
                    .rate
                    .unwrap_or_else(|| 1.0 / self.mean.unwrap_or(1.0));
                match Exp::new(lambda) {
                    Ok(exp) => exp.sample(&mut self.rng),
                    Err(_) => 0.0,
                }
            }
        };

        // normal clamps only when both bounds are given; the other
        // distributions honor whichever bound is present
        let (min, max) = match self.distribution {
            Distribution::Normal if self.min.is_none() || self.max.is_none() => (None, None),
            _ => (self.min, self.max),
        };
        let clamped = clamp(raw, min, max);

        if self.integer {
            let rounded = clamp(clamped.round_ties_even(), min, max);
            GeneratedValue::Json(json!(rounded as i64))
        } else {
            GeneratedValue::Json(json!(round_to(clamped, self.precision)))
        }
    }
}

#[derive(Debug)]
pub struct SequenceGenerator {
    value: f64,
    step: f64,
    min: Option<f64>,
    max: Option<f64>,
    wrap: bool,
    exhausted: bool,
    integer: bool,
}

impl SequenceGenerator {
    fn next_value(&mut self) -> GeneratedValue {
        let emitted = self.value;

        if !self.exhausted {
            let next = self.value + self.step;
            if self.step > 0.0 && self.max.is_some_and(|hi| next > hi) {
                if self.wrap {
                    self.value = self.min.unwrap_or(next);
                } else {
                    self.value = self.max.unwrap_or(next);
                    self.exhausted = true;
                }
            } else if self.step < 0.0 && self.min.is_some_and(|lo| next < lo) {
                if self.wrap {
                    self.value = self.max.unwrap_or(next);
                } else {
                    self.value = self.min.unwrap_or(next);
                    self.exhausted = true;
                }
            } else {
                self.value = next;
            }
        }

        if self.integer {
            GeneratedValue::Json(json!(emitted as i64))
        } else {
            GeneratedValue::Json(json!(emitted))
        }
    }
}

#[derive(Debug)]
pub struct ConstantGenerator {
    value: Value,
    binary: bool,
}

impl ConstantGenerator {
    fn next_value(&mut self) -> GeneratedValue {
        if self.binary {
            // binary constants are text whose bytes get published
            let bytes = self
                .value
                .as_str()
                .map(|s| s.as_bytes().to_vec())
                .unwrap_or_default();
            GeneratedValue::Bytes(bytes)
        } else {
            GeneratedValue::Json(self.value.clone())
        }
    }
}

#[derive(Debug)]
pub struct CustomGenerator {
    handler: HandlerFn,
    device_id: String,
    attribute: String,
    config: Value,
}

/// Stable per-attribute seed: identical `(deviceId, attrName)` pairs
/// produce identical series across runs.
fn attribute_seed(device_id: &str, attribute: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    device_id.hash(&mut hasher);
    attribute.hash(&mut hasher);
    hasher.finish()
}

fn clamp(value: f64, min: Option<f64>, max: Option<f64>) -> f64 {
    let mut v = value;
    if let Some(lo) = min {
        v = v.max(lo);
    }
    if let Some(hi) = max {
        v = v.min(hi);
    }
    v
}

fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> HandlerRegistry {
        HandlerRegistry::builtin()
    }

    fn build(spec: Value, data_type: DataType) -> Generator {
        let spec: GeneratorSpec = serde_json::from_value(spec).unwrap();
        Generator::build(&spec, data_type, "dev-1", "attr", &registry()).unwrap()
    }

    fn next_f64(generator: &mut Generator) -> f64 {
        match generator.next_value(Utc::now()) {
            GeneratedValue::Json(v) => v.as_f64().unwrap(),
            GeneratedValue::Bytes(_) => panic!("expected json"),
        }
    }

    #[test]
    fn test_uniform_respects_bounds() {
        let mut generator = build(
            json!({"type": "random", "min": 20.0, "max": 30.0}),
            DataType::Number,
        );
        for _ in 0..500 {
            let v = next_f64(&mut generator);
            assert!((20.0..=30.0).contains(&v), "out of range: {v}");
        }
    }

    #[test]
    fn test_same_seed_same_series() {
        let spec = json!({"type": "random", "min": 0.0, "max": 100.0});
        let mut a = build(spec.clone(), DataType::Number);
        let mut b = build(spec, DataType::Number);
        let now = Utc::now();
        for _ in 0..50 {
            assert_eq!(a.next_value(now), b.next_value(now));
        }
    }

    #[test]
    fn test_different_attributes_diverge() {
        let spec: GeneratorSpec =
            serde_json::from_value(json!({"type": "random", "min": 0.0, "max": 100.0})).unwrap();
        let mut a =
            Generator::build(&spec, DataType::Number, "dev-1", "temp", &registry()).unwrap();
        let mut b =
            Generator::build(&spec, DataType::Number, "dev-1", "humidity", &registry()).unwrap();
        let now = Utc::now();
        let series_a: Vec<_> = (0..10).map(|_| a.next_value(now)).collect();
        let series_b: Vec<_> = (0..10).map(|_| b.next_value(now)).collect();
        assert_ne!(series_a, series_b);
    }

    #[test]
    fn test_normal_is_clamped_when_bounds_given() {
        let mut generator = build(
            json!({
                "type": "random", "distribution": "normal",
                "mean": 50.0, "stddev": 40.0, "min": 0.0, "max": 100.0
            }),
            DataType::Number,
        );
        for _ in 0..500 {
            let v = next_f64(&mut generator);
            assert!((0.0..=100.0).contains(&v));
        }
    }

    #[test]
    fn test_normal_ignores_a_lone_bound() {
        // with only max set, roughly half the samples land above it
        let mut generator = build(
            json!({
                "type": "random", "distribution": "normal",
                "mean": 100.0, "stddev": 50.0, "max": 100.0
            }),
            DataType::Number,
        );
        let above = (0..200)
            .filter(|_| next_f64(&mut generator) > 100.0)
            .count();
        assert!(above > 0, "lone max must not clamp a normal generator");

        // and with only min set, samples still fall below it
        let mut generator = build(
            json!({
                "type": "random", "distribution": "normal",
                "mean": 100.0, "stddev": 50.0, "min": 100.0
            }),
            DataType::Number,
        );
        let below = (0..200)
            .filter(|_| next_f64(&mut generator) < 100.0)
            .count();
        assert!(below > 0, "lone min must not clamp a normal generator");
    }

    #[test]
    fn test_exponential_honors_a_lone_bound() {
        let mut generator = build(
            json!({
                "type": "random", "distribution": "exponential",
                "mean": 10.0, "max": 5.0
            }),
            DataType::Number,
        );
        for _ in 0..200 {
            assert!(next_f64(&mut generator) <= 5.0);
        }
    }

    #[test]
    fn test_integer_rounds_half_to_even() {
        // pinning min == max makes the sample deterministic; 2.5 rounds
        // down to even rather than up
        let mut generator = build(
            json!({"type": "random", "min": 2.5, "max": 2.5}),
            DataType::Integer,
        );
        match generator.next_value(Utc::now()) {
            GeneratedValue::Json(v) => assert_eq!(v, json!(2)),
            _ => panic!("expected json"),
        }
    }

    #[test]
    fn test_integer_values_stay_integral() {
        let mut generator = build(
            json!({"type": "random", "min": 0.0, "max": 100.0}),
            DataType::Integer,
        );
        for _ in 0..100 {
            match generator.next_value(Utc::now()) {
                GeneratedValue::Json(v) => {
                    let v = v.as_i64().unwrap();
                    assert!((0..=100).contains(&v));
                }
                _ => panic!("expected json"),
            }
        }
    }

    #[test]
    fn test_number_precision_defaults_to_two() {
        let mut generator = build(
            json!({"type": "random", "min": 1.0/3.0, "max": 1.0/3.0}),
            DataType::Number,
        );
        match generator.next_value(Utc::now()) {
            GeneratedValue::Json(v) => assert_eq!(v, json!(0.33)),
            _ => panic!("expected json"),
        }
    }

    #[test]
    fn test_sequence_advances_by_step() {
        let mut generator = build(
            json!({"type": "sequence", "start": 10.0, "step": 5.0}),
            DataType::Number,
        );
        let now = Utc::now();
        let series: Vec<f64> = (0..4)
            .map(|_| match generator.next_value(now) {
                GeneratedValue::Json(v) => v.as_f64().unwrap(),
                _ => panic!(),
            })
            .collect();
        assert_eq!(series, vec![10.0, 15.0, 20.0, 25.0]);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut generator = build(
            json!({"type": "sequence", "start": 0.0, "step": 1.0, "min": 0.0, "max": 2.0, "wrap": true}),
            DataType::Integer,
        );
        let now = Utc::now();
        let series: Vec<i64> = (0..7)
            .map(|_| match generator.next_value(now) {
                GeneratedValue::Json(v) => v.as_i64().unwrap(),
                _ => panic!(),
            })
            .collect();
        assert_eq!(series, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_sequence_clamps_without_wrap() {
        let mut generator = build(
            json!({"type": "sequence", "start": 0.0, "step": 1.0, "max": 2.0}),
            DataType::Integer,
        );
        let now = Utc::now();
        let series: Vec<i64> = (0..5)
            .map(|_| match generator.next_value(now) {
                GeneratedValue::Json(v) => v.as_i64().unwrap(),
                _ => panic!(),
            })
            .collect();
        assert_eq!(series, vec![0, 1, 2, 2, 2]);
    }

    #[test]
    fn test_constant_any_type() {
        let mut generator = build(
            json!({"type": "constant", "value": "v1.2.3"}),
            DataType::String,
        );
        assert_eq!(
            generator.next_value(Utc::now()),
            GeneratedValue::Json(json!("v1.2.3"))
        );
    }

    #[test]
    fn test_binary_constant_emits_bytes() {
        let mut generator = build(
            json!({"type": "constant", "value": "beef"}),
            DataType::Binary,
        );
        assert_eq!(
            generator.next_value(Utc::now()),
            GeneratedValue::Bytes(b"beef".to_vec())
        );
    }

    #[test]
    fn test_unknown_custom_handler_rejected() {
        let spec: GeneratorSpec =
            serde_json::from_value(json!({"type": "custom", "handler": "nope"})).unwrap();
        let err = Generator::build(&spec, DataType::Number, "d", "a", &registry()).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_custom_sine_handler_is_deterministic() {
        let spec: GeneratorSpec = serde_json::from_value(
            json!({"type": "custom", "handler": "sine", "config": {"min": 0.0, "max": 10.0, "periodSecs": 60}}),
        )
        .unwrap();
        let mut a = Generator::build(&spec, DataType::Number, "d", "a", &registry()).unwrap();
        let mut b = Generator::build(&spec, DataType::Number, "d", "a", &registry()).unwrap();
        let now = Utc::now();
        assert_eq!(a.next_value(now), b.next_value(now));
    }
}
