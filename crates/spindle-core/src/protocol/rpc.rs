//! Rpc - 1 回のリクエスト／レスポンスのクライアント側

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use super::codec::{read_message, write_message};
use super::{Message, ProtocolError};

/// Bounds for one exchange.
///
/// `response` covers writing the request and reading the reply, so a peer
/// that accepts the connection and then stalls cannot hold the caller
/// forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcTimeouts {
    pub connect: Duration,
    pub response: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(2_000),
            response: Duration::from_millis(10_000),
        }
    }
}

/// Connect, send `request`, wait for exactly one reply.
pub async fn round_trip(
    addr: SocketAddr,
    request: &Message,
    timeouts: RpcTimeouts,
) -> Result<Message, ProtocolError> {
    let mut stream = timeout(timeouts.connect, TcpStream::connect(addr))
        .await
        .map_err(|_| ProtocolError::Timeout {
            phase: "connect",
            after: timeouts.connect,
        })??;

    let exchange = async {
        write_message(&mut stream, request).await?;
        read_message(&mut stream).await
    };
    timeout(timeouts.response, exchange)
        .await
        .map_err(|_| ProtocolError::Timeout {
            phase: "response",
            after: timeouts.response,
        })?
}

/// Fire a notification and require an `ACK`.
pub async fn send(
    addr: SocketAddr,
    message: &Message,
    timeouts: RpcTimeouts,
) -> Result<(), ProtocolError> {
    match round_trip(addr, message, timeouts).await? {
        Message::Ack => Ok(()),
        other => Err(ProtocolError::UnexpectedRoute(other.route())),
    }
}
