use serde::{Deserialize, Serialize};

/// Device lifecycle states. Initial state is `Created`, terminal is
/// `Deleted`; the manager is the sole author of transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Created,
    Starting,
    Running,
    Reconnecting,
    Stopping,
    Stopped,
    Error,
    Deleted,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }

    /// Counted as running for stats purposes. A reconnecting device is
    /// still operational; its scheduler keeps firing.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Reconnecting)
    }

    /// Any state with live tasks attached.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Reconnecting | Self::Stopping
        )
    }

    /// Transition on a start request.
    pub fn to_starting(&self) -> Result<Self, &'static str> {
        match self {
            Self::Created | Self::Stopped | Self::Error => Ok(Self::Starting),
            Self::Running | Self::Starting | Self::Reconnecting => {
                Err("device is already started")
            }
            _ => Err("device cannot start from its current state"),
        }
    }

    /// Transition once the adapter reports connected.
    pub fn to_running(&self) -> Result<Self, &'static str> {
        match self {
            Self::Starting | Self::Reconnecting => Ok(Self::Running),
            _ => Err("can only enter running from starting or reconnecting"),
        }
    }

    /// Transition on link loss while operational.
    pub fn to_reconnecting(&self) -> Result<Self, &'static str> {
        match self {
            Self::Running => Ok(Self::Reconnecting),
            _ => Err("can only reconnect from running"),
        }
    }

    /// Transition on a stop request.
    pub fn to_stopping(&self) -> Result<Self, &'static str> {
        match self {
            Self::Starting | Self::Running | Self::Reconnecting => Ok(Self::Stopping),
            _ => Err("device is not running"),
        }
    }

    /// Transition once all tasks have wound down.
    pub fn to_stopped(&self) -> Result<Self, &'static str> {
        match self {
            Self::Stopping | Self::Reconnecting => Ok(Self::Stopped),
            _ => Err("can only stop from stopping or reconnecting"),
        }
    }

    /// Transition on a failed start.
    pub fn to_error(&self) -> Result<Self, &'static str> {
        match self {
            Self::Starting | Self::Running | Self::Reconnecting => Ok(Self::Error),
            _ => Err("can only fail from an active state"),
        }
    }

    /// Deletion is allowed from any state; active devices are stopped
    /// first by the manager.
    pub fn to_deleted(&self) -> Self {
        Self::Deleted
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeviceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "reconnecting" => Ok(Self::Reconnecting),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown device status: {other}")),
        }
    }
}
