use std::sync::Arc;

use application::DeviceManager;

/// Shared state behind the control plane: just the manager. The control
/// plane is a thin façade; everything stateful lives below it.
pub struct AppState {
    pub manager: Arc<DeviceManager>,
}

impl AppState {
    pub fn new(manager: Arc<DeviceManager>) -> Self {
        Self { manager }
    }
}
