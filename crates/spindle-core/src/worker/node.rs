use std::sync::Arc;

use async_trait::async_trait;

use super::{LiveTasks, TranscodeRunner};
use crate::domain::{ClientTask, NodeId, StatusReport, TaskId};
use crate::pool::{PoolError, PoolGroup, PoolId, PoolListener, PoolRunner};

struct SlotLog {
    node_id: NodeId,
}

#[async_trait]
impl PoolListener for SlotLog {
    async fn completed(&self, pool_id: PoolId) {
        tracing::debug!(node_id = %self.node_id, pool_id, "pool slot free");
    }
}

/// Accepts tasks into the node's pools.
///
/// A task is live from a successful `offer` until its runner reported the
/// outcome, so status reports and `DELETE_TASK` see it for its whole life.
pub struct WorkerNode {
    node_id: NodeId,
    live: LiveTasks,
    runner: Arc<TranscodeRunner>,
    group: PoolGroup<ClientTask>,
}

impl WorkerNode {
    /// `runner` must share `live` with this node.
    pub fn new(
        node_id: NodeId,
        live: LiveTasks,
        runner: Arc<TranscodeRunner>,
        max_pools: usize,
        idle_threshold: std::time::Duration,
    ) -> Self {
        let group = PoolGroup::new(
            Arc::clone(&runner) as Arc<dyn PoolRunner<ClientTask>>,
            Arc::new(SlotLog { node_id }),
            max_pools,
            idle_threshold,
        );
        Self {
            node_id,
            live,
            runner,
            group,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Try to take `task`. `false` means refused: bound to another node,
    /// already running here, or no free slot.
    pub fn offer(&self, task: ClientTask) -> bool {
        let task_id = task.task_id();
        if task.node.is_some_and(|node| node != self.node_id) {
            tracing::warn!(node_id = %self.node_id, %task_id, "task bound to another node");
            return false;
        }
        if !self.live.insert_if_absent(task.clone()) {
            tracing::debug!(node_id = %self.node_id, %task_id, "task already running");
            return false;
        }
        if !self.group.handle(task) {
            self.live.remove(task_id);
            tracing::debug!(node_id = %self.node_id, %task_id, "no free slot");
            return false;
        }
        tracing::info!(node_id = %self.node_id, %task_id, "task accepted");
        true
    }

    pub fn cancel(&self, task_id: TaskId) -> Result<(), PoolError> {
        let task = self.live.get(task_id).ok_or(PoolError::NotInFlight)?;
        self.group.cancel(&task)
    }

    pub fn status_report(&self) -> StatusReport {
        self.runner.status_report()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn reap(&self) -> usize {
        let reaped = self.group.reap();
        if reaped > 0 {
            tracing::debug!(node_id = %self.node_id, reaped, "idle pools reaped");
        }
        reaped
    }

    pub fn pool_count(&self) -> usize {
        self.group.pool_count()
    }

    /// Interrupt running tasks and wait for the pools to wind down.
    pub async fn shutdown(&self) {
        self.group.shutdown().await;
    }
}
