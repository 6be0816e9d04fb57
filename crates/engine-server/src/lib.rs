pub mod api;
pub mod state;

use std::sync::Arc;

use application::DeviceManager;
use state::AppState;

pub fn setup_app_state(manager: Arc<DeviceManager>) -> Arc<AppState> {
    Arc::new(AppState::new(manager))
}
