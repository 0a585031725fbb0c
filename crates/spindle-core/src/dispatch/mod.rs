//! Dispatch - ノードごとのディスパッチレーン
//!
//! レーンはそのノードへの `ADD_TASK` ハンドシェイクを受け持つ。
//! `enqueue` はブロックせず、結果は 1 件につき 1 回だけ
//! `DispatcherListener` に通知する。

mod lane;

pub use lane::DispatchLane;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ClientTask, Node};

/// One dispatch attempt: the task snapshot and the node it goes to.
#[derive(Debug, Clone)]
pub struct DispatchItem {
    pub task: ClientTask,
    pub node: Node,
}

impl DispatchItem {
    pub fn new(task: ClientTask, node: Node) -> Self {
        Self { task, node }
    }
}

/// Why a dispatch did not end in `TASK_ACCEPTED`.
///
/// The scheduler treats every reason the same way; the distinction is kept
/// for logs and for policies that want to treat an unreachable node
/// differently from a busy one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalReason {
    /// The node answered `TASK_REFUSED`.
    Refused,
    /// Connecting or talking to the node failed.
    Unreachable,
    Timeout,
    /// The node answered something other than accept/refuse for this task.
    Malformed,
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefusalReason::Refused => "refused",
            RefusalReason::Unreachable => "unreachable",
            RefusalReason::Timeout => "timeout",
            RefusalReason::Malformed => "malformed",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub trait DispatcherListener: Send + Sync {
    async fn task_accepted(&self, item: DispatchItem);

    async fn task_refused(&self, item: DispatchItem, reason: RefusalReason);
}
