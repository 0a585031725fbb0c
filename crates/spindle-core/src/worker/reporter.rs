use std::net::SocketAddr;

use async_trait::async_trait;

use crate::protocol::{Message, ProtocolError, RpcTimeouts, send};

/// Where a worker sends task outcomes and crash reports.
#[async_trait]
pub trait TaskReporter: Send + Sync {
    async fn report(&self, message: Message) -> Result<(), ProtocolError>;
}

/// Reports to the coordinator over the wire; every message must be ACKed.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorLink {
    addr: SocketAddr,
    timeouts: RpcTimeouts,
}

impl CoordinatorLink {
    pub fn new(addr: SocketAddr, timeouts: RpcTimeouts) -> Self {
        Self { addr, timeouts }
    }
}

#[async_trait]
impl TaskReporter for CoordinatorLink {
    async fn report(&self, message: Message) -> Result<(), ProtocolError> {
        send(self.addr, &message, self.timeouts).await
    }
}
