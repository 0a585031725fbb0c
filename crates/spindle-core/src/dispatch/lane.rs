use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{DispatchItem, DispatcherListener, RefusalReason};
use crate::domain::NodeId;
use crate::protocol::{Message, ProtocolError, RpcTimeouts, round_trip};

/// Serialized dispatch channel to one node.
///
/// `outstanding` counts items from a successful `enqueue` until their
/// listener callback has started, so `is_free` never reports a lane idle
/// while an item sits between the channel and the RPC.
pub struct DispatchLane {
    node_id: NodeId,
    tx: mpsc::Sender<DispatchItem>,
    outstanding: Arc<AtomicUsize>,
    stop_tx: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchLane {
    /// Start the lane's task. `depth` is the channel capacity (at least 1).
    pub fn spawn(
        node_id: NodeId,
        depth: usize,
        timeouts: RpcTimeouts,
        listener: Arc<dyn DispatcherListener>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let outstanding = Arc::new(AtomicUsize::new(0));

        let join = tokio::spawn(run_lane(
            node_id,
            rx,
            listener,
            timeouts,
            Arc::clone(&outstanding),
            stop_rx,
        ));

        Self {
            node_id,
            tx,
            outstanding,
            stop_tx,
            join: Mutex::new(Some(join)),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Queue `item` without waiting. `false` when the lane is full or stopped;
    /// the item is then dropped and the caller still owns the claim.
    pub fn enqueue(&self, item: DispatchItem) -> bool {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(e) => {
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
                tracing::debug!(node_id = %self.node_id, error = %e, "dispatch lane rejected item");
                false
            }
        }
    }

    /// Nothing queued and no RPC in progress.
    pub fn is_free(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Stop and wait for the lane's task. Queued items are reported refused.
    pub async fn shutdown(&self) {
        self.stop();
        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

async fn run_lane(
    node_id: NodeId,
    mut rx: mpsc::Receiver<DispatchItem>,
    listener: Arc<dyn DispatcherListener>,
    timeouts: RpcTimeouts,
    outstanding: Arc<AtomicUsize>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        if *stop_rx.borrow() {
            break;
        }
        let item = tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let task_id = item.task.task_id();
        let verdict = tokio::select! {
            verdict = AssertUnwindSafe(attempt(&item, timeouts)).catch_unwind() => match verdict {
                Ok(verdict) => verdict,
                Err(_) => {
                    tracing::error!(%node_id, %task_id, "dispatch attempt panicked");
                    Err(RefusalReason::Malformed)
                }
            },
            _ = stop_requested(&mut stop_rx) => {
                tracing::info!(%node_id, %task_id, "dispatch abandoned on shutdown");
                Err(RefusalReason::Unreachable)
            }
        };

        outstanding.fetch_sub(1, Ordering::SeqCst);
        notify(listener.as_ref(), item, verdict).await;
    }

    // Nothing will send these any more; hand the claims back.
    rx.close();
    while let Ok(item) = rx.try_recv() {
        outstanding.fetch_sub(1, Ordering::SeqCst);
        notify(listener.as_ref(), item, Err(RefusalReason::Unreachable)).await;
    }
    tracing::debug!(%node_id, "dispatch lane stopped");
}

/// Resolves once the lane is told to stop or its handle is gone.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}

async fn notify(
    listener: &dyn DispatcherListener,
    item: DispatchItem,
    verdict: Result<(), RefusalReason>,
) {
    match verdict {
        Ok(()) => listener.task_accepted(item).await,
        Err(reason) => listener.task_refused(item, reason).await,
    }
}

/// One `ADD_TASK` handshake. Accepted iff the node answers `TASK_ACCEPTED`
/// for this very task.
async fn attempt(item: &DispatchItem, timeouts: RpcTimeouts) -> Result<(), RefusalReason> {
    let task_id = item.task.task_id();
    let addr = item.node.socket_addr();
    let request = Message::AddTask(item.task.clone());

    let reason = match round_trip(addr, &request, timeouts).await {
        Ok(Message::TaskAccepted { task_id: accepted }) if accepted == task_id => {
            tracing::info!(node_id = %item.node.node_id, %task_id, "task accepted");
            return Ok(());
        }
        Ok(Message::TaskRefused { .. }) => RefusalReason::Refused,
        Ok(other) => {
            tracing::warn!(node_id = %item.node.node_id, %task_id, route = %other.route(), "unexpected dispatch reply");
            RefusalReason::Malformed
        }
        Err(ProtocolError::Timeout { .. }) => RefusalReason::Timeout,
        Err(
            ProtocolError::Codec(_)
            | ProtocolError::FrameTooLarge(_)
            | ProtocolError::UnexpectedRoute(_),
        ) => RefusalReason::Malformed,
        Err(e @ (ProtocolError::Io(_) | ProtocolError::Closed)) => {
            tracing::debug!(%addr, error = %e, "node unreachable");
            RefusalReason::Unreachable
        }
    };
    tracing::info!(node_id = %item.node.node_id, %task_id, %reason, "task refused");
    Err(reason)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::net::TcpListener;
    use tokio::sync::Notify;

    use super::*;
    use crate::domain::task::fixtures::video_task;
    use crate::domain::{JobId, Node};
    use crate::protocol::{MessageHandler, serve};

    enum Verdict {
        Accept,
        Refuse,
        AcceptOtherTask,
        Stall(Arc<Notify>),
    }

    struct FakeNode(Verdict);

    #[async_trait]
    impl MessageHandler for FakeNode {
        async fn handle(&self, message: Message, _peer: SocketAddr) -> Message {
            let Message::AddTask(task) = message else {
                return Message::Bye;
            };
            match &self.0 {
                Verdict::Accept => Message::TaskAccepted {
                    task_id: task.task_id(),
                },
                Verdict::Refuse => Message::TaskRefused {
                    task_id: task.task_id(),
                },
                Verdict::AcceptOtherTask => Message::TaskAccepted {
                    task_id: crate::domain::TaskId::generate(),
                },
                Verdict::Stall(reached) => {
                    reached.notify_one();
                    std::future::pending().await
                }
            }
        }
    }

    async fn fake_node(verdict: Verdict) -> (Node, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve(listener, Arc::new(FakeNode(verdict)), rx));
        (Node::new(NodeId::generate(), "fake", addr), tx)
    }

    #[derive(Debug, PartialEq)]
    enum Outcome {
        Accepted,
        Refused(RefusalReason),
    }

    struct Recorder(mpsc::UnboundedSender<Outcome>);

    #[async_trait]
    impl DispatcherListener for Recorder {
        async fn task_accepted(&self, _item: DispatchItem) {
            let _ = self.0.send(Outcome::Accepted);
        }

        async fn task_refused(&self, _item: DispatchItem, reason: RefusalReason) {
            let _ = self.0.send(Outcome::Refused(reason));
        }
    }

    fn timeouts() -> RpcTimeouts {
        RpcTimeouts {
            connect: Duration::from_millis(300),
            response: Duration::from_millis(300),
        }
    }

    fn lane(node: &Node, depth: usize) -> (DispatchLane, mpsc::UnboundedReceiver<Outcome>) {
        lane_with(node, depth, timeouts())
    }

    fn lane_with(
        node: &Node,
        depth: usize,
        timeouts: RpcTimeouts,
    ) -> (DispatchLane, mpsc::UnboundedReceiver<Outcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let lane = DispatchLane::spawn(node.node_id, depth, timeouts, Arc::new(Recorder(tx)));
        (lane, rx)
    }

    fn item(node: &Node) -> DispatchItem {
        DispatchItem::new(video_task(JobId::generate(), 0, 1), node.clone())
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("listener not called")
            .expect("lane dropped listener")
    }

    #[tokio::test]
    async fn accepted_reply_is_reported_accepted() {
        let (node, _server) = fake_node(Verdict::Accept).await;
        let (lane, mut rx) = lane(&node, 1);

        assert!(lane.enqueue(item(&node)));
        assert_eq!(next(&mut rx).await, Outcome::Accepted);
        assert!(lane.is_free());
    }

    #[tokio::test]
    async fn refusal_is_reported_refused() {
        let (node, _server) = fake_node(Verdict::Refuse).await;
        let (lane, mut rx) = lane(&node, 1);

        assert!(lane.enqueue(item(&node)));
        assert_eq!(next(&mut rx).await, Outcome::Refused(RefusalReason::Refused));
    }

    #[tokio::test]
    async fn accept_for_another_task_is_malformed() {
        let (node, _server) = fake_node(Verdict::AcceptOtherTask).await;
        let (lane, mut rx) = lane(&node, 1);

        assert!(lane.enqueue(item(&node)));
        assert_eq!(next(&mut rx).await, Outcome::Refused(RefusalReason::Malformed));
    }

    #[tokio::test]
    async fn unreachable_node_counts_as_refusal() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let node = Node::new(NodeId::generate(), "gone", addr);
        let (lane, mut rx) = lane(&node, 1);

        assert!(lane.enqueue(item(&node)));
        match next(&mut rx).await {
            Outcome::Refused(RefusalReason::Unreachable | RefusalReason::Timeout) => {}
            other => panic!("expected refusal, got {other:?}"),
        }
        assert!(lane.is_free());
    }

    #[tokio::test]
    async fn stalled_node_times_out_and_full_lane_rejects() {
        let reached = Arc::new(Notify::new());
        let (node, _server) = fake_node(Verdict::Stall(Arc::clone(&reached))).await;
        let (lane, mut rx) = lane(&node, 1);

        assert!(lane.enqueue(item(&node)));
        reached.notified().await;
        assert!(!lane.is_free());
        // one more fits in the channel, the next does not
        assert!(lane.enqueue(item(&node)));
        assert!(!lane.enqueue(item(&node)));

        assert_eq!(next(&mut rx).await, Outcome::Refused(RefusalReason::Timeout));
    }

    #[tokio::test]
    async fn shutdown_abandons_the_attempt_and_refuses_queued_items() {
        let reached = Arc::new(Notify::new());
        let (node, _server) = fake_node(Verdict::Stall(Arc::clone(&reached))).await;
        let slow = RpcTimeouts {
            connect: Duration::from_millis(300),
            response: Duration::from_secs(30),
        };
        let (lane, mut rx) = lane_with(&node, 1, slow);

        assert!(lane.enqueue(item(&node)));
        reached.notified().await;
        assert!(lane.enqueue(item(&node)));

        // does not wait out the response timeout
        tokio::time::timeout(Duration::from_secs(2), lane.shutdown())
            .await
            .expect("shutdown waited for the stalled node");
        assert_eq!(next(&mut rx).await, Outcome::Refused(RefusalReason::Unreachable));
        assert_eq!(next(&mut rx).await, Outcome::Refused(RefusalReason::Unreachable));
        assert!(lane.is_free());
        assert!(!lane.enqueue(item(&node)));
    }
}
