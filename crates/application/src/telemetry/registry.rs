use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use super::generator::GeneratedValue;

/// A custom handler is a pure function of its inputs; identical arguments
/// must yield identical values (the contract that keeps simulations
/// reproducible).
pub type HandlerFn = fn(&str, &str, &Value, DateTime<Utc>) -> GeneratedValue;

/// Registry of named custom handlers the engine was compiled with.
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, HandlerFn>,
}

impl HandlerRegistry {
    /// The built-in handler set.
    pub fn builtin() -> Self {
        let mut handlers: HashMap<&'static str, HandlerFn> = HashMap::new();
        handlers.insert("sine", sine_handler);
        handlers.insert("sawtooth", sawtooth_handler);
        Self { handlers }
    }

    pub fn register(&mut self, name: &'static str, handler: HandlerFn) {
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<HandlerFn> {
        self.handlers.get(name).copied()
    }
}

fn wave_params(config: &Value) -> (f64, f64, f64) {
    let min = config.get("min").and_then(Value::as_f64).unwrap_or(0.0);
    let max = config.get("max").and_then(Value::as_f64).unwrap_or(100.0);
    let period = config
        .get("periodSecs")
        .and_then(Value::as_f64)
        .filter(|p| *p > 0.0)
        .unwrap_or(60.0);
    (min, max, period)
}

/// Sine wave over the configured range, phase-shifted per device so a
/// population does not move in lockstep.
fn sine_handler(device_id: &str, _attribute: &str, config: &Value, now: DateTime<Utc>) -> GeneratedValue {
    let (min, max, period) = wave_params(config);
    let midpoint = min + (max - min) / 2.0;
    let amplitude = (max - min) / 2.0;

    let phase = (device_id.bytes().map(u64::from).sum::<u64>() % 97) as f64 / 97.0;
    let t = now.timestamp_millis() as f64 / 1_000.0;
    let raw = midpoint + amplitude * ((t / period + phase) * 2.0 * std::f64::consts::PI).sin();
    let value = (raw * 100.0).round() / 100.0;
    GeneratedValue::Json(json!(value))
}

/// Rising ramp over the period, snapping back to min.
fn sawtooth_handler(
    _device_id: &str,
    _attribute: &str,
    config: &Value,
    now: DateTime<Utc>,
) -> GeneratedValue {
    let (min, max, period) = wave_params(config);
    let t = now.timestamp_millis() as f64 / 1_000.0;
    let fraction = (t / period).fract();
    let value = ((min + (max - min) * fraction) * 100.0).round() / 100.0;
    GeneratedValue::Json(json!(value))
}
