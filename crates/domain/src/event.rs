use serde::{Deserialize, Serialize};

/// Lifecycle transitions that produce a `device_events` time-series point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
    Started,
    Stopped,
    Reconnecting,
    Error,
    Deleted,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }
}
