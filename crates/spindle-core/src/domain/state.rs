//! State - ジョブ・タスク・ノードの状態

use serde::{Deserialize, Serialize};
use std::fmt;

/// Task state.
///
/// State transitions:
/// - Todo -> Running (claimed for dispatch, then accepted by a node)
/// - Running -> Todo (dispatch refused, work interrupted, node crashed)
/// - Running -> Completed
/// - Running -> Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Todo,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Todo)
    }
}

/// Job state, derived from the states of its tasks.
///
/// Only moves forward: Todo -> Computing -> Completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Todo,
    Computing,
    Completed,
}

/// What a node is currently doing, as last observed by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Free,
    Working,
    /// Did not answer a dispatch or status request in time.
    NotAvailable,
}

/// Health verdict, only changed by crash reports (or an explicit policy call).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeHealth {
    Healthy,
    Suspect,
    Quarantined,
}

impl NodeHealth {
    /// Quarantined nodes keep their record but receive no more tasks.
    pub fn accepts_work(self) -> bool {
        !matches!(self, NodeHealth::Quarantined)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Todo => "todo",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Todo => "todo",
            JobState::Computing => "computing",
            JobState::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::todo(TaskState::Todo, false)]
    #[case::running(TaskState::Running, false)]
    #[case::completed(TaskState::Completed, true)]
    #[case::failed(TaskState::Failed, true)]
    fn terminal_task_states(#[case] state: TaskState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn states_serialize_in_screaming_case() {
        assert_eq!(serde_json::to_string(&TaskState::Todo).unwrap(), "\"TODO\"");
        assert_eq!(
            serde_json::to_string(&JobState::Computing).unwrap(),
            "\"COMPUTING\""
        );
        assert_eq!(
            serde_json::to_string(&NodeStatus::NotAvailable).unwrap(),
            "\"NOT_AVAILABLE\""
        );
    }

    #[test]
    fn quarantined_nodes_take_no_work() {
        assert!(NodeHealth::Healthy.accepts_work());
        assert!(NodeHealth::Suspect.accepts_work());
        assert!(!NodeHealth::Quarantined.accepts_work());
    }
}
