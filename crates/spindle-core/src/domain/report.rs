//! Report - ノードとコーディネーターの間でやり取りするステータス／クラッシュ報告
//!
//! どれも不変のスナップショット。対象の時点で一度だけ作り、そのまま送る。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, NodeId, TaskId};
use super::progress::Progress;
use super::state::NodeStatus;

/// Progress of one task held by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub progress: Progress,
}

/// Point-in-time view of a node: heartbeat payload and crash context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub node_id: NodeId,
    pub status: NodeStatus,
    #[serde(default)]
    pub tasks: Vec<TaskSnapshot>,
    pub free_slots: u32,
    pub total_slots: u32,
    pub taken_at: DateTime<Utc>,
}

impl StatusReport {
    pub fn new(node_id: NodeId, tasks: Vec<TaskSnapshot>, total_slots: u32) -> Self {
        let busy = u32::try_from(tasks.len()).unwrap_or(u32::MAX);
        let free_slots = total_slots.saturating_sub(busy);
        let status = if tasks.is_empty() {
            NodeStatus::Free
        } else {
            NodeStatus::Working
        };
        Self {
            node_id,
            status,
            tasks,
            free_slots,
            total_slots,
            taken_at: Utc::now(),
        }
    }

    pub fn idle(node_id: NodeId, total_slots: u32) -> Self {
        Self::new(node_id, Vec::new(), total_slots)
    }
}

/// Machine-readable failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CauseKind {
    /// A required third-party binary (the encoder) is not installed.
    MissingBinary,
    /// The encoder lacks a codec the task needs.
    MissingDecoder,
    Io,
    Internal,
    Unknown,
}

/// Why a node crashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cause {
    pub kind: CauseKind,
    pub message: String,

    /// True when the node's environment is to blame (missing binary, broken
    /// disk, ...), false when the task itself is.
    pub environment: bool,
}

impl Cause {
    pub fn new(kind: CauseKind, message: impl Into<String>, environment: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            environment,
        }
    }
}

/// A node's own report of a fatal local failure.
///
/// Carries the reporting node's id; the coordinator only accepts it from the
/// address that node registered with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
    pub node_id: NodeId,
    pub cause: Cause,
    pub status: StatusReport,

    /// Task being executed when the failure happened, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    pub reported_at: DateTime<Utc>,
}

impl CrashReport {
    pub fn new(
        node_id: NodeId,
        cause: Cause,
        status: StatusReport,
        task_id: Option<TaskId>,
    ) -> Self {
        Self {
            node_id,
            cause,
            status,
            task_id,
            reported_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_report_counts_slots() {
        let node_id = NodeId::generate();
        let snapshot = TaskSnapshot {
            task_id: TaskId::generate(),
            job_id: JobId::generate(),
            progress: Progress::new(100, 1),
        };
        let report = StatusReport::new(node_id, vec![snapshot], 2);

        assert_eq!(report.status, NodeStatus::Working);
        assert_eq!(report.free_slots, 1);

        let idle = StatusReport::idle(node_id, 2);
        assert_eq!(idle.status, NodeStatus::Free);
        assert_eq!(idle.free_slots, 2);
    }

    #[test]
    fn crash_report_json_shape() {
        let node_id = NodeId::generate();
        let report = CrashReport::new(
            node_id,
            Cause::new(CauseKind::MissingDecoder, "no libx264", true),
            StatusReport::idle(node_id, 1),
            None,
        );

        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["cause"]["kind"], "MISSING_DECODER");
        assert_eq!(v["cause"]["environment"], true);
        assert!(v.get("task_id").is_none());
    }
}
