use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::config::CoordinatorConfig;
use crate::dispatch::{DispatchItem, DispatchLane, DispatcherListener, RefusalReason};
use crate::domain::{
    ClientTask, CrashReport, Job, JobId, JobSpec, JobState, Node, NodeId, NodeStatus,
    StatusReport, TaskId,
};
use crate::error::{Result, SpindleError};
use crate::observability::ClusterCounts;
use crate::ports::{IdGenerator, SystemClock, UlidGenerator};
use crate::protocol::{Message, ProtocolError, TaskUpdate, round_trip};

type SharedJob = Arc<Mutex<Job>>;
type SharedNode = Arc<Mutex<Node>>;

/// Cluster state and scheduling decisions.
///
/// Jobs and nodes each sit behind their own lock; the registries are only
/// locked long enough to clone an `Arc` out. No code path holds two job
/// locks, or a job and a node lock, at the same time.
pub struct Coordinator {
    config: CoordinatorConfig,
    ids: Box<dyn IdGenerator>,
    jobs: RwLock<HashMap<JobId, SharedJob>>,
    nodes: RwLock<HashMap<NodeId, SharedNode>>,
    lanes: RwLock<HashMap<NodeId, Arc<DispatchLane>>>,
    /// One scheduling pass at a time.
    schedule_lock: Mutex<()>,
    wake: Notify,
    me: Weak<Coordinator>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        Self::with_ids(config, UlidGenerator::new(SystemClock))
    }

    pub fn with_ids(config: CoordinatorConfig, ids: impl IdGenerator + 'static) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            ids: Box::new(ids),
            jobs: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            lanes: RwLock::new(HashMap::new()),
            schedule_lock: Mutex::new(()),
            wake: Notify::new(),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ========================================
    // Registration
    // ========================================

    /// Empty job with a fresh id; add tasks, then hand it to `add_job`.
    pub fn new_job(&self, spec: JobSpec) -> Job {
        Job::new(self.ids.generate_job_id(), spec)
    }

    pub fn new_task_id(&self) -> TaskId {
        self.ids.generate_task_id()
    }

    pub fn new_node(&self, name: impl Into<String>, address: SocketAddr) -> Node {
        Node::new(self.ids.generate_node_id(), name, address)
    }

    pub async fn add_job(&self, job: Job) -> JobId {
        let job_id = job.job_id;
        tracing::info!(
            %job_id,
            name = %job.name,
            priority = job.priority,
            tasks = job.task_count(),
            "job added"
        );
        self.jobs
            .write()
            .await
            .insert(job_id, Arc::new(Mutex::new(job)));
        self.wake.notify_one();
        job_id
    }

    /// Register a node and start its dispatch lane.
    pub async fn register_node(&self, node: Node) -> Result<NodeId> {
        let node_id = node.node_id;
        let addr = node.socket_addr();
        {
            let mut nodes = self.nodes.write().await;
            if nodes.contains_key(&node_id) {
                return Err(SpindleError::DuplicateNode(node_id));
            }
            nodes.insert(node_id, Arc::new(Mutex::new(node)));
        }

        let listener = Arc::new(LaneListener(self.me.clone()));
        let lane = DispatchLane::spawn(
            node_id,
            self.config.lane_depth,
            self.config.rpc_timeouts(),
            listener,
        );
        self.lanes.write().await.insert(node_id, Arc::new(lane));

        tracing::info!(%node_id, %addr, "node registered");
        self.wake.notify_one();
        Ok(node_id)
    }

    // ========================================
    // Lookups
    // ========================================

    async fn job_arc(&self, job_id: JobId) -> Result<SharedJob> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(SpindleError::JobNotFound(job_id))
    }

    async fn node_arc(&self, node_id: NodeId) -> Result<SharedNode> {
        self.nodes
            .read()
            .await
            .get(&node_id)
            .cloned()
            .ok_or(SpindleError::NodeNotFound(node_id))
    }

    /// Snapshot of a job.
    pub async fn job(&self, job_id: JobId) -> Result<Job> {
        Ok(self.job_arc(job_id).await?.lock().await.clone())
    }

    /// Snapshot of a node.
    pub async fn node(&self, node_id: NodeId) -> Result<Node> {
        Ok(self.node_arc(node_id).await?.lock().await.clone())
    }

    pub async fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().await.keys().copied().collect()
    }

    /// Claim the next TODO task of a job, see `Job::next_runnable_task`.
    pub async fn next_runnable_task(&self, job_id: JobId) -> Result<Option<ClientTask>> {
        Ok(self.job_arc(job_id).await?.lock().await.next_runnable_task())
    }

    pub async fn remaining_count(&self, job_id: JobId) -> Result<usize> {
        Ok(self.job_arc(job_id).await?.lock().await.remaining_count())
    }

    // ========================================
    // Scheduling
    // ========================================

    /// Resolves when something happened that may make a scheduling pass
    /// productive (new job or node, a task finished, a node freed up).
    pub async fn schedule_requested(&self) {
        self.wake.notified().await;
    }

    /// One scheduling pass: every dispatchable node with an idle lane gets
    /// the next task of the best job. Returns how many items were enqueued.
    pub async fn schedule(&self) -> usize {
        let _pass = self.schedule_lock.lock().await;
        let nodes: Vec<SharedNode> = self.nodes.read().await.values().cloned().collect();

        let mut dispatched = 0;
        for node in nodes {
            let node = {
                let node = node.lock().await;
                if !node.is_dispatchable() {
                    continue;
                }
                node.clone()
            };
            let Some(lane) = self.lanes.read().await.get(&node.node_id).cloned() else {
                continue;
            };
            if !lane.is_free() {
                continue;
            }

            let node_id = node.node_id;
            let Some((job, task)) = self.claim_best_task(node_id).await else {
                // nothing runnable anywhere
                break;
            };
            let task_id = task.task_id();
            tracing::debug!(%node_id, %task_id, "dispatching task");

            if lane.enqueue(DispatchItem::new(task, node)) {
                dispatched += 1;
            } else {
                job.lock().await.release_claim(task_id, node_id);
            }
        }
        dispatched
    }

    /// Claim a task for `node_id` from the first job, in job order, that
    /// still has one.
    async fn claim_best_task(&self, node_id: NodeId) -> Option<(SharedJob, ClientTask)> {
        let jobs: Vec<SharedJob> = self.jobs.read().await.values().cloned().collect();

        let mut ranked = Vec::with_capacity(jobs.len());
        for job in jobs {
            let key = {
                let guard = job.lock().await;
                if guard.state == JobState::Completed || guard.remaining_count() == 0 {
                    continue;
                }
                guard.order_key()
            };
            ranked.push((key, job));
        }
        ranked.sort_by_key(|(key, _)| *key);

        for (_, job) in ranked {
            let claimed = job.lock().await.claim_task_for(node_id);
            if let Some(task) = claimed {
                return Some((job, task));
            }
        }
        None
    }

    // ========================================
    // Dispatch outcomes
    // ========================================

    pub async fn task_accepted(&self, item: DispatchItem) {
        let task_id = item.task.task_id();
        let node_id = item.node.node_id;

        // the node's outcome report may have been handled first
        let bound = match self.job_arc(item.task.job_id()).await {
            Ok(job) => job.lock().await.bind_task(task_id, node_id),
            Err(e) => {
                tracing::warn!(%node_id, %task_id, error = %e, "accepted task has no job");
                false
            }
        };
        if !bound {
            tracing::debug!(%node_id, %task_id, "accepted task was no longer claimed");
            return;
        }

        if let Ok(node) = self.node_arc(node_id).await {
            let mut node = node.lock().await;
            node.mark_seen();
            node.status = NodeStatus::Working;
        }
    }

    /// Every reason is handled the same way: the claim goes back to TODO.
    pub async fn task_refused(&self, item: DispatchItem, reason: RefusalReason) {
        let task_id = item.task.task_id();
        let node_id = item.node.node_id;
        tracing::debug!(%node_id, %task_id, %reason, "releasing refused task");

        match self.job_arc(item.task.job_id()).await {
            Ok(job) => {
                if job.lock().await.release_claim(task_id, node_id) {
                    self.wake.notify_one();
                }
            }
            Err(e) => tracing::warn!(%task_id, error = %e, "refused task has no job"),
        }
    }

    // ========================================
    // Node reports
    // ========================================

    /// Known node, and the message came from the address it registered with.
    async fn verify_origin(&self, node_id: NodeId, peer: SocketAddr) -> Result<SharedNode> {
        let node = self.node_arc(node_id).await?;
        let address = node.lock().await.address;
        if address != peer.ip() {
            tracing::warn!(%node_id, %peer, registered = %address, "rejecting spoofed node message");
            return Err(SpindleError::Spoofed { node_id, peer });
        }
        Ok(node)
    }

    /// Whether `update` is about a task currently bound to its sender.
    fn is_current(job: &Job, update: &TaskUpdate) -> Result<bool> {
        let task = job
            .task(update.task_id)
            .ok_or(SpindleError::TaskNotFound(update.task_id))?;
        let current = task.node == Some(update.node_id);
        if !current {
            tracing::debug!(
                node_id = %update.node_id,
                task_id = %update.task_id,
                "ignoring update for a task not bound to this node"
            );
        }
        Ok(current)
    }

    async fn free_node(node: &SharedNode) {
        let mut node = node.lock().await;
        node.mark_seen();
        if node.status == NodeStatus::Working {
            node.status = NodeStatus::Free;
        }
    }

    pub async fn task_progress(&self, update: TaskUpdate, peer: SocketAddr) -> Result<()> {
        let node = self.verify_origin(update.node_id, peer).await?;
        let job = self.job_arc(update.job_id).await?;
        {
            let mut job = job.lock().await;
            if !Self::is_current(&job, &update)? {
                return Ok(());
            }
            if let Some(task) = job.task_mut(update.task_id) {
                task.progress.merge_report(&update.progress);
            }
        }
        node.lock().await.mark_seen();
        Ok(())
    }

    pub async fn task_completed(&self, update: TaskUpdate, peer: SocketAddr) -> Result<()> {
        let node = self.verify_origin(update.node_id, peer).await?;
        let job = self.job_arc(update.job_id).await?;
        let job_completed = {
            let mut job = job.lock().await;
            if !Self::is_current(&job, &update)? {
                return Ok(());
            }
            job.complete_task(update.task_id);
            job.state == JobState::Completed
        };

        tracing::info!(node_id = %update.node_id, task_id = %update.task_id, "task completed");
        if job_completed {
            tracing::info!(job_id = %update.job_id, "job completed");
        }
        Self::free_node(&node).await;
        self.wake.notify_one();
        Ok(())
    }

    /// Execution failure: the task ends FAILED. The node's health is not
    /// touched; only crash reports do that.
    pub async fn task_failed(&self, update: TaskUpdate, peer: SocketAddr) -> Result<()> {
        let node = self.verify_origin(update.node_id, peer).await?;
        let job = self.job_arc(update.job_id).await?;
        {
            let mut job = job.lock().await;
            if !Self::is_current(&job, &update)? {
                return Ok(());
            }
            job.fail_task(update.task_id);
        }

        tracing::warn!(
            node_id = %update.node_id,
            task_id = %update.task_id,
            reason = update.reason.as_deref().unwrap_or("unknown"),
            "task failed"
        );
        node.lock().await.failed_tasks += 1;
        Self::free_node(&node).await;
        self.wake.notify_one();
        Ok(())
    }

    /// Interrupted work goes back to TODO with no penalty for the node.
    pub async fn task_interrupted(&self, update: TaskUpdate, peer: SocketAddr) -> Result<()> {
        let node = self.verify_origin(update.node_id, peer).await?;
        let job = self.job_arc(update.job_id).await?;
        {
            let mut job = job.lock().await;
            if !Self::is_current(&job, &update)? {
                return Ok(());
            }
            job.release_task(update.task_id);
        }

        tracing::info!(node_id = %update.node_id, task_id = %update.task_id, "task interrupted");
        Self::free_node(&node).await;
        self.wake.notify_one();
        Ok(())
    }

    /// Record a crash, update the node's health and hand every task bound to
    /// it back to TODO. Returns the released task ids.
    pub async fn node_crashed(&self, report: CrashReport, peer: SocketAddr) -> Result<Vec<TaskId>> {
        let node_id = report.node_id;
        let node = self.verify_origin(node_id, peer).await?;
        {
            let mut node = node.lock().await;
            tracing::warn!(
                %node_id,
                kind = ?report.cause.kind,
                environment = report.cause.environment,
                message = %report.cause.message,
                task_id = ?report.task_id,
                "node crash reported"
            );
            let environment = report.cause.environment;
            node.record_crash(report);
            if let Some(limit) = self.config.quarantine_after {
                if environment && node.environment_crashes >= limit {
                    node.quarantine();
                    tracing::warn!(%node_id, crashes = node.environment_crashes, "node quarantined");
                }
            }
        }

        let released = self.release_node_tasks(node_id).await;
        if !released.is_empty() {
            tracing::info!(%node_id, released = released.len(), "tasks released after crash");
            self.wake.notify_one();
        }
        Ok(released)
    }

    async fn release_node_tasks(&self, node_id: NodeId) -> Vec<TaskId> {
        let jobs: Vec<SharedJob> = self.jobs.read().await.values().cloned().collect();
        let mut released = Vec::new();
        for job in jobs {
            released.extend(job.lock().await.release_node_tasks(node_id));
        }
        released
    }

    /// Apply a status report the node sent or answered with.
    pub async fn record_status(&self, report: StatusReport, peer: SocketAddr) -> Result<()> {
        let node = self.verify_origin(report.node_id, peer).await?;
        self.apply_status(&node, &report).await;
        Ok(())
    }

    async fn apply_status(&self, node: &SharedNode, report: &StatusReport) {
        {
            let mut node = node.lock().await;
            node.mark_seen();
            node.status = report.status;
        }
        for snapshot in &report.tasks {
            let Ok(job) = self.job_arc(snapshot.job_id).await else {
                continue;
            };
            let mut job = job.lock().await;
            if let Some(task) = job.task_mut(snapshot.task_id) {
                if task.node == Some(report.node_id) {
                    task.progress.merge_report(&snapshot.progress);
                }
            }
        }
    }

    /// Release tasks the node accepted before `accepted_before` but no longer
    /// holds. It reports a task until its outcome is delivered, so these
    /// ended without one.
    async fn release_unreported(
        &self,
        report: &StatusReport,
        accepted_before: DateTime<Utc>,
    ) -> Vec<TaskId> {
        let held: Vec<TaskId> = report.tasks.iter().map(|t| t.task_id).collect();
        let jobs: Vec<SharedJob> = self.jobs.read().await.values().cloned().collect();
        let mut released = Vec::new();
        for job in jobs {
            released.extend(
                job.lock()
                    .await
                    .release_unreported(report.node_id, &held, accepted_before),
            );
        }
        released
    }

    /// Heartbeat one node.
    ///
    /// No timely `STATUS_REPORT` is handled like a refusal: the node becomes
    /// NOT_AVAILABLE and its tasks go back to TODO, health untouched. Tasks
    /// missing from a report are released the same way.
    pub async fn poll_status(&self, node_id: NodeId) -> Result<StatusReport> {
        let node = self.node_arc(node_id).await?;
        let addr = node.lock().await.socket_addr();
        let sent_at = Utc::now();

        let reply = match round_trip(addr, &Message::StatusRequest, self.config.heartbeat_timeouts())
            .await
        {
            Ok(Message::StatusReport(report)) if report.node_id == node_id => Ok(report),
            Ok(other) => Err(ProtocolError::UnexpectedRoute(other.route())),
            Err(e) => Err(e),
        };

        match reply {
            Ok(report) => {
                self.apply_status(&node, &report).await;
                let released = self.release_unreported(&report, sent_at).await;
                if !released.is_empty() {
                    tracing::warn!(%node_id, released = released.len(), "node lost track of tasks");
                    self.wake.notify_one();
                }
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(%node_id, %addr, error = %e, "node did not answer status request");
                node.lock().await.status = NodeStatus::NotAvailable;
                let released = self.release_node_tasks(node_id).await;
                if !released.is_empty() {
                    tracing::info!(%node_id, released = released.len(), "tasks released from silent node");
                    self.wake.notify_one();
                }
                Err(e.into())
            }
        }
    }

    /// Heartbeat every node concurrently. Returns how many answered.
    pub async fn poll_all(&self) -> usize {
        let ids = self.node_ids().await;
        let results = join_all(ids.into_iter().map(|id| self.poll_status(id))).await;
        let answered = results.iter().filter(|r| r.is_ok()).count();
        if answered > 0 {
            self.wake.notify_one();
        }
        answered
    }

    // ========================================
    // Operator actions
    // ========================================

    pub async fn quarantine(&self, node_id: NodeId) -> Result<()> {
        self.node_arc(node_id).await?.lock().await.quarantine();
        tracing::warn!(%node_id, "node quarantined by operator");
        Ok(())
    }

    pub async fn reinstate(&self, node_id: NodeId) -> Result<()> {
        self.node_arc(node_id).await?.lock().await.reinstate();
        tracing::info!(%node_id, "node reinstated");
        self.wake.notify_one();
        Ok(())
    }

    pub async fn counts(&self) -> ClusterCounts {
        let mut counts = ClusterCounts::default();
        let jobs: Vec<SharedJob> = self.jobs.read().await.values().cloned().collect();
        for job in jobs {
            counts.add_job(&*job.lock().await);
        }
        let nodes: Vec<SharedNode> = self.nodes.read().await.values().cloned().collect();
        for node in nodes {
            counts.add_node(&*node.lock().await);
        }
        counts
    }

    /// Stop every dispatch lane. Items still queued are released.
    pub async fn shutdown(&self) {
        let lanes: Vec<Arc<DispatchLane>> = self.lanes.read().await.values().cloned().collect();
        join_all(lanes.iter().map(|lane| lane.shutdown())).await;
    }
}

/// Forwards lane verdicts to the coordinator without keeping it alive.
struct LaneListener(Weak<Coordinator>);

#[async_trait]
impl DispatcherListener for LaneListener {
    async fn task_accepted(&self, item: DispatchItem) {
        if let Some(coordinator) = self.0.upgrade() {
            coordinator.task_accepted(item).await;
        }
    }

    async fn task_refused(&self, item: DispatchItem, reason: RefusalReason) {
        if let Some(coordinator) = self.0.upgrade() {
            coordinator.task_refused(item, reason).await;
        }
    }
}
