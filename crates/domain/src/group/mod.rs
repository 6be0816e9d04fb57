mod dropout;
mod launch;

pub use dropout::{DropoutConfig, DropoutStrategy};
pub use launch::{LaunchConfig, LaunchStrategy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A collection of devices created from one model; the unit of launch and
/// dropout orchestration. The group indexes its members but does not own
/// their lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub model_id: String,
    pub expected_count: usize,
    pub id_pattern: String,
    pub members: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub const DEFAULT_ID_PATTERN: &'static str = "{modelId}-{index}";

    pub fn new(id: String, model_id: String, expected_count: usize, id_pattern: String) -> Self {
        Self {
            id,
            model_id,
            expected_count,
            id_pattern,
            members: Vec::with_capacity(expected_count),
            created_at: Utc::now(),
        }
    }

    /// Expands the id pattern for one member index.
    pub fn member_id(pattern: &str, model_id: &str, index: usize) -> String {
        pattern
            .replace("{modelId}", model_id)
            .replace("{index}", &index.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pattern() {
        assert_eq!(Group::member_id(Group::DEFAULT_ID_PATTERN, "t1", 3), "t1-3");
    }

    #[test]
    fn test_custom_pattern() {
        assert_eq!(Group::member_id("sensor-{index}", "t1", 0), "sensor-0");
        assert_eq!(Group::member_id("x-{index}", "t1", 9), "x-9");
    }
}
