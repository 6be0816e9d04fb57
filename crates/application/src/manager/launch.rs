use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use domain::error::EngineError;
use domain::group::LaunchConfig;

use super::DeviceManager;

/// Walks the ordered membership as one cooperative loop, sleeping to each
/// member's offset from the launch epoch. Cancelling the token stops
/// scheduled starts that have not fired yet.
pub(super) async fn run_launcher(
    manager: Arc<DeviceManager>,
    group_id: String,
    members: Vec<String>,
    config: LaunchConfig,
    cancel: CancellationToken,
) {
    let epoch = tokio::time::Instant::now();
    let total = members.len();
    info!(group_id = %group_id, members = total, strategy = ?config.strategy, "Group launch started");

    let mut started = 0usize;
    for (index, device_id) in members.iter().enumerate() {
        let target = epoch + config.offset(index);
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(group_id = %group_id, started, remaining = total - index, "Group launch cancelled");
                return;
            }
            _ = tokio::time::sleep_until(target) => {}
        }

        match manager.start_device(device_id).await {
            Ok(_) => started += 1,
            // concurrent start or an already-running member; not a launch failure
            Err(EngineError::Conflict(_)) => {}
            Err(e) => {
                warn!(group_id = %group_id, device_id = %device_id, error = %e, "Member start failed")
            }
        }
    }

    manager.clear_launcher(&group_id).await;
    info!(group_id = %group_id, started, "Group launch dispatched");
}
