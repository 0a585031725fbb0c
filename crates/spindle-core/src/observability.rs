use serde::{Deserialize, Serialize};

use crate::domain::{Job, JobState, Node, NodeHealth, NodeStatus, TaskState};

/// Point-in-time cluster summary, as returned by `Coordinator::counts`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCounts {
    pub jobs_todo: usize,
    pub jobs_computing: usize,
    pub jobs_completed: usize,

    pub tasks_todo: usize,
    pub tasks_running: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,

    pub nodes_free: usize,
    pub nodes_working: usize,
    pub nodes_not_available: usize,
    pub nodes_suspect: usize,
    pub nodes_quarantined: usize,
}

impl ClusterCounts {
    pub fn add_job(&mut self, job: &Job) {
        match job.state {
            JobState::Todo => self.jobs_todo += 1,
            JobState::Computing => self.jobs_computing += 1,
            JobState::Completed => self.jobs_completed += 1,
        }
        for task in &job.tasks {
            match task.state() {
                TaskState::Todo => self.tasks_todo += 1,
                TaskState::Running => self.tasks_running += 1,
                TaskState::Completed => self.tasks_completed += 1,
                TaskState::Failed => self.tasks_failed += 1,
            }
        }
    }

    pub fn add_node(&mut self, node: &Node) {
        match node.status {
            NodeStatus::Free => self.nodes_free += 1,
            NodeStatus::Working => self.nodes_working += 1,
            NodeStatus::NotAvailable => self.nodes_not_available += 1,
        }
        match node.health {
            NodeHealth::Healthy => {}
            NodeHealth::Suspect => self.nodes_suspect += 1,
            NodeHealth::Quarantined => self.nodes_quarantined += 1,
        }
    }
}
