//! Ping/pong liveness for a single link.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::link::Link;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer stopped answering; the link has been closed.
    TimedOut,
    /// The link closed for another reason.
    LinkClosed,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Ping `link` every `interval` until it dies, closes or `cancel` fires.
///
/// Each tick checks whether the peer showed activity since the previous one.
/// After `timeout / interval` consecutive silent ticks (at least one) the
/// link is closed. Pings never wait for queue capacity, so a stalled writer
/// cannot hold the tick up.
pub async fn run_heartbeat(
    link: Arc<Link>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval(interval);
    // the first tick completes immediately
    let _ = ticker.tick().await;
    let mut missed: u32 = 0;
    let interval_ms = interval.as_millis().max(1);
    #[allow(clippy::cast_possible_truncation)]
    let max_missed = (timeout.as_millis() / interval_ms).max(1) as u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !link.is_operational() {
                    return HeartbeatResult::LinkClosed;
                }
                if link.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        warn!(
                            link_id = %link.id(),
                            silent_for = ?link.last_pong_elapsed(),
                            "peer stopped answering pings, closing link"
                        );
                        link.close();
                        return HeartbeatResult::TimedOut;
                    }
                }
                if let Err(e) = link.try_send_ping(Bytes::new()) {
                    debug!(link_id = %link.id(), error = %e, "ping not sent");
                    return HeartbeatResult::LinkClosed;
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
