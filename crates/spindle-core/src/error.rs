use std::net::SocketAddr;

use thiserror::Error;

use crate::domain::{JobId, NodeId, TaskId};
use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum SpindleError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("node {0} is already registered")]
    DuplicateNode(NodeId),

    /// A node-originated message whose id does not match the sender.
    #[error("message for {node_id} came from {peer}, which is not its registered address")]
    Spoofed { node_id: NodeId, peer: SocketAddr },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SpindleError>;
