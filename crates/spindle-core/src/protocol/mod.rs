//! Protocol - コーディネーターとワーカーノードの間のワイヤプロトコル
//!
//! やり取りは素の TCP 接続上で、リクエスト 1 フレームにレスポンス 1 フレーム。
//! フレームは big-endian の `u32` 長さと JSON エンコードした `Message`。
//! ルートタグがステータスコードを兼ね、返信のルートが `TASK_ACCEPTED`
//! のときに限りディスパッチは受理とみなす。

pub mod codec;
pub mod rpc;
pub mod server;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ClientTask, CrashReport, JobId, NodeId, Progress, StatusReport, TaskId};

pub use codec::{MAX_FRAME_LEN, read_message, write_message};
pub use rpc::{RpcTimeouts, round_trip, send};
pub use server::{MessageHandler, serve};

/// Route / status code of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Route {
    AddTask,
    TaskAccepted,
    TaskRefused,
    DeleteTask,
    StatusRequest,
    StatusReport,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskInterrupted,
    NodeCrash,
    Ack,
    Bye,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Route::AddTask => "ADD_TASK",
            Route::TaskAccepted => "TASK_ACCEPTED",
            Route::TaskRefused => "TASK_REFUSED",
            Route::DeleteTask => "DELETE_TASK",
            Route::StatusRequest => "STATUS_REQUEST",
            Route::StatusReport => "STATUS_REPORT",
            Route::TaskProgress => "TASK_PROGRESS",
            Route::TaskCompleted => "TASK_COMPLETED",
            Route::TaskFailed => "TASK_FAILED",
            Route::TaskInterrupted => "TASK_INTERRUPTED",
            Route::NodeCrash => "NODE_CRASH",
            Route::Ack => "ACK",
            Route::Bye => "BYE",
        };
        f.write_str(s)
    }
}

/// Task progress or outcome sent by the node running it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub node_id: NodeId,
    pub job_id: JobId,
    pub task_id: TaskId,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TaskUpdate {
    pub fn new(node_id: NodeId, task: &ClientTask) -> Self {
        Self {
            node_id,
            job_id: task.job_id(),
            task_id: task.task_id(),
            progress: task.progress.clone(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// One protocol message: route tag plus typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "route", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Coordinator -> node: run this task.
    AddTask(ClientTask),
    TaskAccepted { task_id: TaskId },
    TaskRefused { task_id: TaskId },
    /// Coordinator -> node: cancel this task.
    DeleteTask { task_id: TaskId },

    StatusRequest,
    StatusReport(StatusReport),

    TaskProgress(TaskUpdate),
    TaskCompleted(TaskUpdate),
    TaskFailed(TaskUpdate),
    TaskInterrupted(TaskUpdate),
    NodeCrash(CrashReport),

    Ack,
    Bye,
}

impl Message {
    pub fn route(&self) -> Route {
        match self {
            Message::AddTask(_) => Route::AddTask,
            Message::TaskAccepted { .. } => Route::TaskAccepted,
            Message::TaskRefused { .. } => Route::TaskRefused,
            Message::DeleteTask { .. } => Route::DeleteTask,
            Message::StatusRequest => Route::StatusRequest,
            Message::StatusReport(_) => Route::StatusReport,
            Message::TaskProgress(_) => Route::TaskProgress,
            Message::TaskCompleted(_) => Route::TaskCompleted,
            Message::TaskFailed(_) => Route::TaskFailed,
            Message::TaskInterrupted(_) => Route::TaskInterrupted,
            Message::NodeCrash(_) => Route::NodeCrash,
            Message::Ack => Route::Ack,
            Message::Bye => Route::Bye,
        }
    }

    /// Node that claims to have sent this message, for node-originated routes.
    pub fn origin(&self) -> Option<NodeId> {
        match self {
            Message::StatusReport(report) => Some(report.node_id),
            Message::TaskProgress(update)
            | Message::TaskCompleted(update)
            | Message::TaskFailed(update)
            | Message::TaskInterrupted(update) => Some(update.node_id),
            Message::NodeCrash(report) => Some(report.node_id),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    #[error("{phase} timed out after {after:?}")]
    Timeout { phase: &'static str, after: Duration },

    #[error("connection closed by peer")]
    Closed,

    #[error("unexpected reply route {0}")]
    UnexpectedRoute(Route),
}
