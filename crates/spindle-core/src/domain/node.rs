//! Node - コーディネーターから見たクラスタノード

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::NodeId;
use super::report::CrashReport;
use super::state::{NodeHealth, NodeStatus};

/// Crash reports kept per node; older ones only survive in the counters.
pub const CRASH_HISTORY: usize = 16;

/// A worker known to the coordinator.
///
/// Nodes are never deleted: a misbehaving node is quarantined, and its
/// recent crash history stays attached for debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: NodeId,
    pub name: String,
    pub address: IpAddr,
    pub port: u16,

    pub status: NodeStatus,
    pub health: NodeHealth,

    /// Crashes the node attributed to its own environment.
    pub environment_crashes: u32,
    /// Tasks that ended FAILED on this node. Informational only.
    pub failed_tasks: u32,
    /// Every crash ever reported, environment-attributed or not.
    pub crash_count: u32,

    /// The last `CRASH_HISTORY` reports, oldest first.
    pub crash_reports: VecDeque<CrashReport>,

    pub last_seen: Option<DateTime<Utc>>,
}

impl Node {
    pub fn new(node_id: NodeId, name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            node_id,
            name: name.into(),
            address: address.ip(),
            port: address.port(),
            status: NodeStatus::Free,
            health: NodeHealth::Healthy,
            environment_crashes: 0,
            failed_tasks: 0,
            crash_count: 0,
            crash_reports: VecDeque::new(),
            last_seen: None,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Free, reachable and not quarantined.
    pub fn is_dispatchable(&self) -> bool {
        self.status == NodeStatus::Free && self.health.accepts_work()
    }

    pub fn mark_seen(&mut self) {
        self.last_seen = Some(Utc::now());
        if self.status == NodeStatus::NotAvailable {
            self.status = NodeStatus::Free;
        }
    }

    /// Record a crash report. Environment-attributed causes make the node
    /// SUSPECT; a quarantined node stays quarantined.
    pub fn record_crash(&mut self, report: CrashReport) {
        if report.cause.environment {
            self.environment_crashes += 1;
            if self.health == NodeHealth::Healthy {
                self.health = NodeHealth::Suspect;
            }
        }
        self.status = NodeStatus::Free;
        self.last_seen = Some(Utc::now());
        self.crash_count += 1;
        if self.crash_reports.len() == CRASH_HISTORY {
            self.crash_reports.pop_front();
        }
        self.crash_reports.push_back(report);
    }

    pub fn quarantine(&mut self) {
        self.health = NodeHealth::Quarantined;
    }

    /// Back to HEALTHY, e.g. after an operator fixed the environment.
    pub fn reinstate(&mut self) {
        self.health = NodeHealth::Healthy;
        self.environment_crashes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::report::{Cause, CauseKind, StatusReport};

    fn node() -> Node {
        Node::new(NodeId::generate(), "encoder-1", "127.0.0.1:7000".parse().unwrap())
    }

    fn crash(node_id: NodeId, environment: bool) -> CrashReport {
        let cause = Cause::new(CauseKind::MissingBinary, "ffmpeg not found", environment);
        CrashReport::new(node_id, cause, StatusReport::idle(node_id, 1), None)
    }

    #[test]
    fn environment_crash_marks_suspect() {
        let mut n = node();
        n.record_crash(crash(n.node_id, true));

        assert_eq!(n.health, NodeHealth::Suspect);
        assert_eq!(n.environment_crashes, 1);
        assert_eq!(n.crash_reports.len(), 1);
        assert!(n.is_dispatchable());
    }

    #[test]
    fn task_attributed_crash_keeps_health() {
        let mut n = node();
        n.record_crash(crash(n.node_id, false));

        assert_eq!(n.health, NodeHealth::Healthy);
        assert_eq!(n.environment_crashes, 0);
        assert_eq!(n.crash_reports.len(), 1);
    }

    #[test]
    fn crash_history_keeps_only_the_latest_reports() {
        let mut n = node();
        for i in 0..CRASH_HISTORY + 5 {
            let mut report = crash(n.node_id, true);
            report.cause.message = format!("crash {i}");
            n.record_crash(report);
        }

        assert_eq!(n.crash_reports.len(), CRASH_HISTORY);
        assert_eq!(n.crash_count as usize, CRASH_HISTORY + 5);
        assert_eq!(n.environment_crashes as usize, CRASH_HISTORY + 5);
        assert_eq!(n.crash_reports.front().unwrap().cause.message, "crash 5");
        assert_eq!(
            n.crash_reports.back().unwrap().cause.message,
            format!("crash {}", CRASH_HISTORY + 4)
        );
    }

    #[test]
    fn quarantine_is_a_status_change() {
        let mut n = node();
        n.quarantine();
        n.record_crash(crash(n.node_id, true));

        assert_eq!(n.health, NodeHealth::Quarantined);
        assert!(!n.is_dispatchable());
        assert_eq!(n.socket_addr(), "127.0.0.1:7000".parse().unwrap());
    }

    #[test]
    fn seen_node_becomes_available_again() {
        let mut n = node();
        n.status = NodeStatus::NotAvailable;
        n.mark_seen();
        assert_eq!(n.status, NodeStatus::Free);
        assert!(n.last_seen.is_some());
    }
}
