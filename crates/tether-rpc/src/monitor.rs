//! Periodic consistency monitor.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::SessionRegistry;

/// Sweep `registry` every `interval` until `cancel` fires.
///
/// Every tick runs [`SessionRegistry::sweep`]: each session reconciles its
/// outstanding operations, sends a consistency request to its peer and is
/// evicted once it has nothing left to do.
pub async fn run_consistency_monitor(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let _ = ticker.tick().await;
    info!(interval_secs = interval.as_secs(), "consistency monitor started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = registry.sweep().await;
                debug!(evicted, sessions = registry.len(), "consistency tick");
            }
            () = cancel.cancelled() => {
                info!("consistency monitor stopped");
                return;
            }
        }
    }
}

/// Spawn [`run_consistency_monitor`] with the registry's configured
/// interval.
pub fn spawn_consistency_monitor(
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval = registry.config().control_interval;
    tokio::spawn(run_consistency_monitor(registry, interval, cancel))
}
