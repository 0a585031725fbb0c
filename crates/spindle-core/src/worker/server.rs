use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::WorkerNode;
use crate::protocol::{Message, MessageHandler};

/// Answers coordinator requests on the worker's port.
pub struct WorkerServer {
    node: Arc<WorkerNode>,
}

impl WorkerServer {
    pub fn new(node: Arc<WorkerNode>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl MessageHandler for WorkerServer {
    async fn handle(&self, message: Message, peer: SocketAddr) -> Message {
        match message {
            Message::AddTask(task) => {
                let task_id = task.task_id();
                if self.node.offer(task) {
                    Message::TaskAccepted { task_id }
                } else {
                    Message::TaskRefused { task_id }
                }
            }
            Message::StatusRequest => Message::StatusReport(self.node.status_report()),
            Message::DeleteTask { task_id } => match self.node.cancel(task_id) {
                Ok(()) => Message::Ack,
                Err(e) => {
                    tracing::info!(%peer, %task_id, error = %e, "delete refused");
                    Message::TaskRefused { task_id }
                }
            },
            other => {
                tracing::warn!(%peer, route = %other.route(), "route not handled by the worker");
                Message::Bye
            }
        }
    }
}
