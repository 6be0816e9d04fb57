use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::info;

use domain::error::Result;
use domain::group::{DropoutConfig, DropoutStrategy};

use super::{AcceptedDropout, DeviceManager};

/// Selects victims and spawns the dropout walker. Selection is
/// deterministic (ascending device id) for non-random strategies; the
/// random strategy seeds its PRNG from `(groupId, wallClock)`.
pub(super) async fn start_dropout(
    manager: &Arc<DeviceManager>,
    group_id: &str,
    config: DropoutConfig,
) -> Result<AcceptedDropout> {
    let running = manager.running_simulated_members(group_id).await?;
    let count = config.target_count(running.len());

    let schedule: Vec<(String, Duration)> = match config.strategy {
        DropoutStrategy::Random => {
            let mut rng = StdRng::seed_from_u64(dropout_seed(group_id));
            let selected: Vec<String> = running
                .choose_multiple(&mut rng, count)
                .cloned()
                .collect();
            let duration_ms = config.duration_ms.unwrap_or(0);
            let mut times: Vec<u64> = (0..count)
                .map(|_| {
                    if duration_ms == 0 {
                        0
                    } else {
                        rng.gen_range(0..duration_ms)
                    }
                })
                .collect();
            times.sort_unstable();
            selected
                .into_iter()
                .zip(times)
                .map(|(id, ms)| (id, Duration::from_millis(ms)))
                .collect()
        }
        _ => running
            .into_iter()
            .take(count)
            .enumerate()
            .map(|(k, id)| {
                // offset() only returns None for the random strategy
                let offset = config.offset(k).unwrap_or_default();
                (id, offset)
            })
            .collect(),
    };

    let accepted = AcceptedDropout {
        affected_count: schedule.len(),
        estimated_duration_ms: schedule
            .last()
            .map(|(_, offset)| offset.as_millis() as u64)
            .unwrap_or(0),
    };

    let cancel = CancellationToken::new();
    manager
        .set_group_dropout(group_id, Some(cancel.clone()))
        .await;
    tokio::spawn(run_dropout(
        manager.clone(),
        group_id.to_string(),
        schedule,
        config,
        cancel,
    ));

    Ok(accepted)
}

/// One cooperative loop over the dropout schedule; sleeps to each victim's
/// offset and severs its link.
async fn run_dropout(
    manager: Arc<DeviceManager>,
    group_id: String,
    schedule: Vec<(String, Duration)>,
    config: DropoutConfig,
    cancel: CancellationToken,
) {
    let epoch = tokio::time::Instant::now();
    let total = schedule.len();
    info!(group_id = %group_id, affected = total, strategy = ?config.strategy, "Dropout started");

    let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms);
    for (device_id, offset) in schedule {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(group_id = %group_id, "Dropout cancelled");
                return;
            }
            _ = tokio::time::sleep_until(epoch + offset) => {}
        }
        manager
            .sever_device(&device_id, config.reconnect, reconnect_delay)
            .await;
    }

    manager.set_group_dropout(&group_id, None).await;
    info!(group_id = %group_id, affected = total, "Dropout dispatched");
}

fn dropout_seed(group_id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    group_id.hash(&mut hasher);
    chrono::Utc::now().timestamp_millis().hash(&mut hasher);
    hasher.finish()
}
