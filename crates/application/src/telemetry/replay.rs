use serde_json::Value;

use domain::error::{EngineError, Result};
use domain::model::ReplayFormat;

use super::generator::GeneratedValue;

/// Replays one column of a recorded trace. Rows are loaded once at device
/// start; the attribute's own interval drives the tempo, not the trace's
/// original timing.
#[derive(Debug)]
pub struct ReplayGenerator {
    rows: Vec<Value>,
    cursor: usize,
    looped: bool,
}

impl ReplayGenerator {
    pub fn load(path: &str, format: ReplayFormat, column: &str, looped: bool) -> Result<Self> {
        let rows = match format {
            ReplayFormat::Csv => load_csv(path, column)?,
            ReplayFormat::Jsonl => load_jsonl(path, column)?,
        };
        if rows.is_empty() {
            return Err(EngineError::Validation(format!(
                "replay trace {path} has no rows for column {column}"
            )));
        }
        Ok(Self {
            rows,
            cursor: 0,
            looped,
        })
    }

    pub fn next_value(&mut self) -> GeneratedValue {
        let value = self.rows[self.cursor].clone();
        if self.cursor + 1 < self.rows.len() {
            self.cursor += 1;
        } else if self.looped {
            self.cursor = 0;
        }
        // at EOF without loop the final value repeats
        GeneratedValue::Json(value)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn load_csv(path: &str, column: &str) -> Result<Vec<Value>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| EngineError::Validation(format!("replay trace {path}: {e}")))?;

    let headers = reader
        .headers()
        .map_err(|e| EngineError::Validation(format!("replay trace {path}: {e}")))?
        .clone();
    let index = headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| {
            EngineError::Validation(format!("replay trace {path}: no column {column}"))
        })?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| EngineError::Validation(format!("replay trace {path}: {e}")))?;
        let Some(cell) = record.get(index) else {
            continue;
        };
        // numbers stay numbers, everything else is a string
        let value = match cell.parse::<f64>() {
            Ok(n) => serde_json::json!(n),
            Err(_) => Value::String(cell.to_string()),
        };
        rows.push(value);
    }
    Ok(rows)
}

fn load_jsonl(path: &str, column: &str) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Validation(format!("replay trace {path}: {e}")))?;

    let mut rows = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row: Value = serde_json::from_str(line)
            .map_err(|e| EngineError::Validation(format!("replay trace {path}: {e}")))?;
        if let Some(value) = row.get(column) {
            rows.push(value.clone());
        }
    }
    Ok(rows)
}
