//! Loops - バックグラウンドループ
//!
//! どのループも shutdown watch と競合させ、`true` を受けたら次の周回で抜ける。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::scheduler::Coordinator;
use crate::worker::WorkerNode;

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Run a scheduling pass on every tick and whenever the coordinator asks for
/// one (a task was released, a node became free, a job arrived).
pub async fn schedule_loop(coordinator: Arc<Coordinator>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut tick = ticker(coordinator.config().schedule_interval());
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = tick.tick() => {}
            _ = coordinator.schedule_requested() => {}
        }
        let dispatched = coordinator.schedule().await;
        if dispatched > 0 {
            tracing::debug!(dispatched, "schedule pass");
        }
    }
    tracing::debug!("schedule loop stopped");
}

/// Poll every node's status on the heartbeat interval.
pub async fn heartbeat_loop(coordinator: Arc<Coordinator>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut tick = ticker(coordinator.config().heartbeat_interval());
    // skip the immediate first tick, nodes were just registered
    tick.tick().await;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = tick.tick() => {}
        }
        let answered = coordinator.poll_all().await;
        tracing::trace!(answered, "heartbeat round");
    }
    tracing::debug!("heartbeat loop stopped");
}

/// Drop the node's idle pools on the reap interval.
pub async fn reaper_loop(
    node: Arc<WorkerNode>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut tick = ticker(period);
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = tick.tick() => {}
        }
        node.reap();
    }
    tracing::debug!(node_id = %node.node_id(), "reaper loop stopped");
}
