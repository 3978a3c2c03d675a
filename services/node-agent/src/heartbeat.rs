//! Heartbeat loop keeping the node registered with the coordinator.

use std::time::Duration;

use fleet_proto::Node;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, FleetClient};

/// Why the heartbeat loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Shutdown,
    /// The coordinator evicted the node; it must register again.
    Expired,
}

/// Sends heartbeats every `interval` until shutdown or eviction.
///
/// The first heartbeat goes out one interval after start, since registration
/// already set the deadline.
pub async fn run_heartbeat_loop(
    client: FleetClient,
    node: Node,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> HeartbeatOutcome {
    info!(
        node_id = %node.node_id,
        interval_secs = interval.as_secs_f64(),
        "Starting heartbeat loop"
    );

    let mut consecutive_failures = 0u32;
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match client.send_node_heartbeat(node, interval).await {
                    Ok(true) => {
                        consecutive_failures = 0;
                        debug!(node_id = %node.node_id, "Heartbeat acknowledged");
                    }
                    Ok(false) | Err(ClientError::NodeExpired(_)) => {
                        warn!(node_id = %node.node_id, "Node expired, stopping heartbeats");
                        return HeartbeatOutcome::Expired;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(error = %e, consecutive_failures, "Heartbeat failed");
                        } else {
                            error!(error = %e, consecutive_failures, "Heartbeat failed repeatedly");
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Heartbeat loop shutting down");
                    return HeartbeatOutcome::Shutdown;
                }
            }
        }
    }
}
