//! Server - コーディネーターとワーカー共通の accept ループ

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::codec::{read_message, write_message};
use super::{Message, ProtocolError};

/// Turns one incoming request into one reply.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message, peer: SocketAddr) -> Message;
}

/// Accept connections until `shutdown` flips to true.
///
/// Each connection gets its own task and may carry several request/reply
/// pairs; it ends when the peer closes it or sends `BYE`.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let accepted = tokio::select! {
            changed = shutdown.changed() => {
                // sender dropped: nobody can stop us any more, so stop now
                if changed.is_err() {
                    break;
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer)) => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, peer, handler).await {
                        tracing::debug!(%peer, error = %e, "connection ended with error");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
            }
        }
    }
    tracing::debug!("server loop stopped");
}

async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn MessageHandler>,
) -> Result<(), ProtocolError> {
    loop {
        let request = match read_message(&mut socket).await {
            Ok(request) => request,
            Err(ProtocolError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        if matches!(request, Message::Bye) {
            write_message(&mut socket, &Message::Bye).await?;
            return Ok(());
        }

        let route = request.route();
        let reply = handler.handle(request, peer).await;
        tracing::trace!(%peer, %route, reply = %reply.route(), "handled request");
        write_message(&mut socket, &reply).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::rpc::{RpcTimeouts, round_trip};
    use crate::protocol::Route;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, message: Message, _peer: SocketAddr) -> Message {
            match message {
                Message::StatusRequest => Message::Ack,
                _ => Message::Bye,
            }
        }
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, Arc::new(Echo), rx));

        let reply = round_trip(addr, &Message::StatusRequest, RpcTimeouts::default())
            .await
            .unwrap();
        assert_eq!(reply.route(), Route::Ack);

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap();
    }
}
