//! Job - 変換リクエストとそのタスク群

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, NodeId, TaskId};
use super::state::{JobState, TaskState};
use super::task::ClientTask;

/// Folder (under the job output folder) holding encoded parts before muxing.
pub const PARTS_FOLDER: &str = "parts";

/// What a caller provides to create a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,

    /// Source file, relative to the shared folder.
    pub source_file: String,

    /// Lower value = scheduled first.
    #[serde(default)]
    pub priority: i32,

    /// Total source duration, milliseconds.
    pub duration_ms: u64,

    pub frame_rate: f64,

    /// Estimated from duration and frame rate when absent.
    #[serde(default)]
    pub frame_count: Option<u64>,

    /// Folder receiving job outputs, relative to the shared folder.
    pub output_root: String,
}

/// One end-to-end transcode request.
///
/// Owned by the coordinator, which keeps each job behind its own lock; every
/// method here assumes the caller holds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub name: String,
    pub priority: i32,
    pub state: JobState,

    pub source_file: String,
    pub duration_ms: u64,
    pub frame_count: u64,
    pub frame_rate: f64,

    /// `<output_root>/<name>`.
    pub output_folder: String,
    /// `<source stem>.mkv`, relative to `output_folder`.
    pub output_file_name: String,
    pub parts_folder: String,

    /// Tasks in insertion order. A task with `node == Some(_)` is in flight.
    pub tasks: Vec<ClientTask>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_id: JobId, spec: JobSpec) -> Self {
        let now = Utc::now();
        let frame_count = spec.frame_count.unwrap_or_else(|| {
            ((spec.duration_ms as f64 / 1000.0) * spec.frame_rate).floor() as u64
        });
        let stem = Path::new(&spec.source_file)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| spec.name.clone());
        let output_folder = Path::new(&spec.output_root)
            .join(&spec.name)
            .to_string_lossy()
            .into_owned();

        Self {
            job_id,
            name: spec.name,
            priority: spec.priority,
            state: JobState::Todo,
            source_file: spec.source_file,
            duration_ms: spec.duration_ms,
            frame_count,
            frame_rate: spec.frame_rate,
            output_folder,
            output_file_name: format!("{stem}.mkv"),
            parts_folder: PARTS_FOLDER.to_string(),
            tasks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_task(&mut self, task: ClientTask) {
        self.tasks.push(task);
        self.updated_at = Utc::now();
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task(&self, task_id: TaskId) -> Option<&ClientTask> {
        self.tasks.iter().find(|t| t.task_id() == task_id)
    }

    pub fn task_mut(&mut self, task_id: TaskId) -> Option<&mut ClientTask> {
        self.tasks.iter_mut().find(|t| t.task_id() == task_id)
    }

    /// Tasks currently bound to a node.
    pub fn in_flight(&self) -> impl Iterator<Item = &ClientTask> {
        self.tasks.iter().filter(|t| t.node.is_some())
    }

    /// Claim the first TODO task in insertion order.
    ///
    /// The claimed task moves to RUNNING with no node bound, so a second
    /// caller holding the job lock after us skips it. A refused dispatch
    /// hands it back with `release_task`. The first claim moves the job from
    /// TODO to COMPUTING.
    pub fn next_runnable_task(&mut self) -> Option<ClientTask> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.state() == TaskState::Todo)?;
        task.node = None;
        task.progress.state = TaskState::Running;
        let claimed = task.clone();

        if self.state == JobState::Todo {
            self.state = JobState::Computing;
        }
        self.updated_at = Utc::now();
        Some(claimed)
    }

    /// Claim the next TODO task and assign it to `node_id` before the
    /// dispatch goes out.
    ///
    /// The node may start the task and report on it before its
    /// `TASK_ACCEPTED` is processed; the assignment lets those reports match.
    pub fn claim_task_for(&mut self, node_id: NodeId) -> Option<ClientTask> {
        let task_id = self.next_runnable_task()?.task_id();
        let task = self.task_mut(task_id)?;
        task.node = Some(node_id);
        Some(task.clone())
    }

    /// Tasks left to dispatch.
    ///
    /// A task claimed by dispatch (or running on a node) no longer counts
    /// once the job has left TODO.
    pub fn remaining_count(&self) -> usize {
        match self.state {
            JobState::Completed => 0,
            JobState::Todo => self.tasks.len(),
            JobState::Computing => self
                .tasks
                .iter()
                .filter(|t| t.state() == TaskState::Todo)
                .count(),
        }
    }

    pub fn completed_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.state() == TaskState::Completed)
            .count()
    }

    /// Bind a claimed task to the node that accepted it.
    ///
    /// Fails when the claim is gone: the task was released, finished or
    /// handed to another node in the meantime.
    pub fn bind_task(&mut self, task_id: TaskId, node_id: NodeId) -> bool {
        let Some(task) = self.task_mut(task_id) else {
            return false;
        };
        if task.state() != TaskState::Running || !task.node.is_none_or(|n| n == node_id) {
            return false;
        }
        task.node = Some(node_id);
        task.progress.start();
        self.updated_at = Utc::now();
        true
    }

    /// Put a non-terminal task back to TODO.
    pub fn release_task(&mut self, task_id: TaskId) -> bool {
        let Some(task) = self.task_mut(task_id) else {
            return false;
        };
        if task.state().is_terminal() {
            return false;
        }
        task.release();
        self.updated_at = Utc::now();
        true
    }

    /// Give up a claim made for `node_id`. A claim since taken over by
    /// another node is left alone.
    pub fn release_claim(&mut self, task_id: TaskId, node_id: NodeId) -> bool {
        match self.task(task_id) {
            Some(task) if task.node.is_none_or(|n| n == node_id) => self.release_task(task_id),
            _ => false,
        }
    }

    /// Release tasks `node_id` accepted before `accepted_before` that are
    /// missing from `reported`, the ids the node says it holds.
    pub fn release_unreported(
        &mut self,
        node_id: NodeId,
        reported: &[TaskId],
        accepted_before: DateTime<Utc>,
    ) -> Vec<TaskId> {
        let mut released = Vec::new();
        for task in self.tasks.iter_mut() {
            let accepted = task
                .progress
                .started_at
                .is_some_and(|at| at < accepted_before);
            if task.node == Some(node_id)
                && accepted
                && !task.state().is_terminal()
                && !reported.contains(&task.task_id())
            {
                task.release();
                released.push(task.task_id());
            }
        }
        if !released.is_empty() {
            self.updated_at = Utc::now();
        }
        released
    }

    /// Release every task bound to `node_id`; returns their ids.
    pub fn release_node_tasks(&mut self, node_id: NodeId) -> Vec<TaskId> {
        let mut released = Vec::new();
        for task in self.tasks.iter_mut() {
            if task.node == Some(node_id) && !task.state().is_terminal() {
                task.release();
                released.push(task.task_id());
            }
        }
        if !released.is_empty() {
            self.updated_at = Utc::now();
        }
        released
    }

    pub fn complete_task(&mut self, task_id: TaskId) -> bool {
        let Some(task) = self.task_mut(task_id) else {
            return false;
        };
        if task.state() != TaskState::Running {
            return false;
        }
        task.progress.complete();
        task.node = None;
        self.update_state_from_tasks();
        true
    }

    pub fn fail_task(&mut self, task_id: TaskId) -> bool {
        let Some(task) = self.task_mut(task_id) else {
            return false;
        };
        if task.state() != TaskState::Running {
            return false;
        }
        task.progress.fail();
        task.node = None;
        self.updated_at = Utc::now();
        true
    }

    /// Recompute the job state after a task reached a terminal state.
    ///
    /// Never moves backwards: a COMPLETED job stays COMPLETED.
    pub fn update_state_from_tasks(&mut self) {
        if self.state == JobState::Completed {
            return;
        }
        if !self.tasks.is_empty()
            && self
                .tasks
                .iter()
                .all(|t| t.state() == TaskState::Completed)
        {
            self.state = JobState::Completed;
        } else if self.tasks.iter().any(|t| t.state() != TaskState::Todo) {
            self.state = JobState::Computing;
        }
        self.updated_at = Utc::now();
    }

    /// Scheduling key: priority, then remaining tasks, then job length, then
    /// id so that distinct jobs never compare equal.
    pub fn order_key(&self) -> JobOrderKey {
        JobOrderKey {
            priority: self.priority,
            remaining: self.remaining_count(),
            length_ms: self.duration_ms,
            job_id: self.job_id,
        }
    }
}

/// Snapshot of the fields jobs are ordered by.
///
/// The coordinator builds these under each job's lock and sorts the keys,
/// so no two job locks are ever held at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct JobOrderKey {
    pub priority: i32,
    pub remaining: usize,
    pub length_ms: u64,
    pub job_id: JobId,
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id
    }
}

impl Eq for Job {}

impl Hash for Job {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.job_id.hash(state);
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Job {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.job_id == other.job_id {
            return Ordering::Equal;
        }
        self.order_key().cmp(&other.order_key())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use rstest::rstest;

    #[test]
    fn new_job_derives_outputs_and_frame_count() {
        let job = Job::new(JobId::generate(), spec("trailer", 0, 10_500));
        assert_eq!(job.state, JobState::Todo);
        assert_eq!(job.frame_count, 252);
        assert_eq!(job.output_file_name, "source.mkv");
        assert_eq!(job.output_folder, "outputs/trailer");
        assert_eq!(job.parts_folder, PARTS_FOLDER);
    }

    #[test]
    fn next_runnable_task_follows_insertion_order() {
        let mut job = job_with_video_tasks(3);
        let ids: Vec<TaskId> = job.tasks.iter().map(|t| t.task_id()).collect();

        let first = job.next_runnable_task().unwrap();
        let second = job.next_runnable_task().unwrap();
        let third = job.next_runnable_task().unwrap();

        assert_eq!(first.task_id(), ids[0]);
        assert_eq!(second.task_id(), ids[1]);
        assert_eq!(third.task_id(), ids[2]);
        assert!(job.next_runnable_task().is_none());
    }

    #[test]
    fn first_claim_moves_job_to_computing() {
        let mut job = job_with_video_tasks(2);
        assert_eq!(job.remaining_count(), 2);

        job.next_runnable_task().unwrap();
        assert_eq!(job.state, JobState::Computing);
        assert_eq!(job.remaining_count(), 1);
    }

    #[test]
    fn empty_job_stays_todo() {
        let mut job = job_with_video_tasks(0);
        assert!(job.next_runnable_task().is_none());
        assert_eq!(job.state, JobState::Todo);
        assert_eq!(job.remaining_count(), 0);
    }

    #[test]
    fn released_task_becomes_runnable_again() {
        let mut job = job_with_video_tasks(2);
        let first = job.next_runnable_task().unwrap();
        assert!(job.release_task(first.task_id()));

        let again = job.next_runnable_task().unwrap();
        assert_eq!(again.task_id(), first.task_id());
    }

    #[test]
    fn remaining_count_never_increases_as_tasks_progress() {
        let mut job = job_with_video_tasks(3);
        let node = NodeId::generate();
        let mut last = job.remaining_count();

        while let Some(task) = job.next_runnable_task() {
            let now = job.remaining_count();
            assert!(now <= last);
            last = now;

            assert!(job.bind_task(task.task_id(), node));
            assert!(job.complete_task(task.task_id()));
            assert!(job.remaining_count() <= last);
        }

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.remaining_count(), 0);
        assert_eq!(job.completed_count(), 3);
    }

    #[test]
    fn completion_requires_every_task() {
        let mut job = job_with_video_tasks(2);
        let node = NodeId::generate();
        let a = job.next_runnable_task().unwrap();
        let b = job.next_runnable_task().unwrap();
        job.bind_task(a.task_id(), node);
        job.bind_task(b.task_id(), node);

        job.complete_task(a.task_id());
        assert_eq!(job.state, JobState::Computing);

        job.fail_task(b.task_id());
        assert_eq!(job.state, JobState::Computing);
        assert_eq!(job.task(b.task_id()).unwrap().state(), TaskState::Failed);
    }

    #[test]
    fn release_node_tasks_only_touches_that_node() {
        let mut job = job_with_video_tasks(3);
        let crashed = NodeId::generate();
        let healthy = NodeId::generate();

        let a = job.next_runnable_task().unwrap();
        let b = job.next_runnable_task().unwrap();
        job.bind_task(a.task_id(), crashed);
        job.bind_task(b.task_id(), healthy);

        let released = job.release_node_tasks(crashed);
        assert_eq!(released, vec![a.task_id()]);
        assert_eq!(job.task(a.task_id()).unwrap().state(), TaskState::Todo);
        assert_eq!(job.task(b.task_id()).unwrap().state(), TaskState::Running);
        assert_eq!(job.in_flight().count(), 1);
    }

    #[test]
    fn terminal_tasks_are_not_released() {
        let mut job = job_with_video_tasks(1);
        let node = NodeId::generate();
        let a = job.next_runnable_task().unwrap();
        job.bind_task(a.task_id(), node);
        job.complete_task(a.task_id());

        assert!(!job.release_task(a.task_id()));
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn claim_for_a_node_assigns_it_before_acceptance() {
        let mut job = job_with_video_tasks(2);
        let node = NodeId::generate();
        let other = NodeId::generate();

        let claimed = job.claim_task_for(node).unwrap();
        assert_eq!(claimed.node, Some(node));
        assert_eq!(claimed.state(), TaskState::Running);
        assert!(claimed.progress.started_at.is_none());
        assert_eq!(job.remaining_count(), 1);

        // only the assigned node can take it over
        assert!(!job.bind_task(claimed.task_id(), other));
        assert!(!job.release_claim(claimed.task_id(), other));
        assert!(job.bind_task(claimed.task_id(), node));
        assert!(job.task(claimed.task_id()).unwrap().progress.started_at.is_some());
    }

    #[test]
    fn late_acceptance_of_a_finished_or_released_task_is_refused() {
        let mut job = job_with_video_tasks(2);
        let node = NodeId::generate();

        let done = job.claim_task_for(node).unwrap();
        assert!(job.complete_task(done.task_id()));
        assert!(!job.bind_task(done.task_id(), node));

        let crashed = job.claim_task_for(node).unwrap();
        assert_eq!(job.release_node_tasks(node), vec![crashed.task_id()]);
        assert!(!job.bind_task(crashed.task_id(), node));
        assert_eq!(job.task(crashed.task_id()).unwrap().state(), TaskState::Todo);
    }

    #[test]
    fn unreported_tasks_accepted_before_the_poll_are_released() {
        let mut job = job_with_video_tasks(3);
        let node = NodeId::generate();

        let lost = job.claim_task_for(node).unwrap();
        let kept = job.claim_task_for(node).unwrap();
        job.bind_task(lost.task_id(), node);
        job.bind_task(kept.task_id(), node);
        let poll_sent = Utc::now() + chrono::Duration::milliseconds(1);
        // claimed after the poll went out, not yet on the node
        let pending = job.claim_task_for(node).unwrap();

        let released = job.release_unreported(node, &[kept.task_id()], poll_sent);
        assert_eq!(released, vec![lost.task_id()]);
        assert_eq!(job.task(kept.task_id()).unwrap().state(), TaskState::Running);
        assert_eq!(job.task(pending.task_id()).unwrap().node, Some(node));
    }

    fn job_with(priority: i32, remaining: u32, duration_ms: u64) -> Job {
        let mut job = Job::new(JobId::generate(), spec("j", priority, duration_ms));
        for i in 0..remaining {
            job.add_task(crate::domain::task::fixtures::video_task(job.job_id, i, 1));
        }
        job
    }

    #[test]
    fn ordering_is_priority_then_remaining_then_length() {
        let a = job_with(1, 5, 100);
        let b = job_with(1, 3, 200);
        let c = job_with(2, 1, 1);

        // Same priority: fewer remaining tasks first.
        assert!(b < a);
        // Priority dominates everything else.
        assert!(a < c);
        assert!(b < c);

        let mut jobs = vec![c.clone(), a.clone(), b.clone()];
        jobs.sort();
        assert_eq!(jobs, vec![b, a, c]);
    }

    #[rstest]
    #[case::shorter_first(100, 200, Ordering::Less)]
    #[case::longer_last(300, 200, Ordering::Greater)]
    fn length_breaks_ties(#[case] left: u64, #[case] right: u64, #[case] expected: Ordering) {
        let l = job_with(1, 2, left);
        let r = job_with(1, 2, right);
        assert_eq!(l.cmp(&r), expected);
    }

    #[test]
    fn identical_keys_are_still_strictly_ordered() {
        let a = job_with(1, 2, 100);
        let b = job_with(1, 2, 100);
        assert_ne!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
    }

    #[test]
    fn equality_is_by_id_only() {
        let a = job_with(1, 2, 100);
        let mut same = a.clone();
        same.priority = 9;
        same.tasks.clear();
        assert_eq!(a, same);
        assert_eq!(a.cmp(&same), Ordering::Equal);
    }
}
