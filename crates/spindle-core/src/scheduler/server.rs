use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::Coordinator;
use crate::error::Result;
use crate::protocol::{Message, MessageHandler};

/// Answers node-originated messages on the coordinator's port.
///
/// Every accepted report is answered with `ACK`. A rejected one (unknown
/// node, spoofed sender, unknown task) gets `BYE`, which the node's `send`
/// surfaces as an unexpected reply.
pub struct CoordinatorServer {
    coordinator: Arc<Coordinator>,
}

impl CoordinatorServer {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }

    async fn dispatch(&self, message: Message, peer: SocketAddr) -> Option<Result<()>> {
        let c = &self.coordinator;
        let result = match message {
            Message::TaskProgress(update) => c.task_progress(update, peer).await,
            Message::TaskCompleted(update) => c.task_completed(update, peer).await,
            Message::TaskFailed(update) => c.task_failed(update, peer).await,
            Message::TaskInterrupted(update) => c.task_interrupted(update, peer).await,
            Message::NodeCrash(report) => c.node_crashed(report, peer).await.map(|_| ()),
            Message::StatusReport(report) => c.record_status(report, peer).await,
            _ => return None,
        };
        Some(result)
    }
}

#[async_trait]
impl MessageHandler for CoordinatorServer {
    async fn handle(&self, message: Message, peer: SocketAddr) -> Message {
        let route = message.route();
        match self.dispatch(message, peer).await {
            Some(Ok(())) => Message::Ack,
            Some(Err(e)) => {
                tracing::warn!(%peer, %route, error = %e, "rejected node message");
                Message::Bye
            }
            None => {
                tracing::warn!(%peer, %route, "route not handled by the coordinator");
                Message::Bye
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::domain::{Cause, CauseKind, CrashReport, NodeHealth, NodeId, StatusReport};
    use crate::protocol::Route;

    #[tokio::test]
    async fn acks_known_nodes_and_rejects_spoofers() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let node = coordinator.new_node("n", "127.0.0.1:9".parse().unwrap());
        let node_id = coordinator.register_node(node).await.unwrap();
        let server = CoordinatorServer::new(Arc::clone(&coordinator));

        let crash = |id: NodeId| {
            Message::NodeCrash(CrashReport::new(
                id,
                Cause::new(CauseKind::MissingDecoder, "no av1 decoder", true),
                StatusReport::idle(id, 1),
                None,
            ))
        };

        let spoofed = server
            .handle(crash(node_id), "192.168.0.50:1234".parse().unwrap())
            .await;
        assert_eq!(spoofed.route(), Route::Bye);
        assert_eq!(
            coordinator.node(node_id).await.unwrap().health,
            NodeHealth::Healthy
        );

        let genuine = server
            .handle(crash(node_id), "127.0.0.1:1234".parse().unwrap())
            .await;
        assert_eq!(genuine.route(), Route::Ack);
        assert_eq!(
            coordinator.node(node_id).await.unwrap().health,
            NodeHealth::Suspect
        );
    }

    #[tokio::test]
    async fn coordinator_does_not_take_task_assignments() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let server = CoordinatorServer::new(coordinator);
        let reply = server
            .handle(Message::StatusRequest, "127.0.0.1:1".parse().unwrap())
            .await;
        assert_eq!(reply.route(), Route::Bye);
    }
}
