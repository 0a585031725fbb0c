//! Task - スケジュール可能なエンコード作業の単位

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ids::{JobId, NodeId, TaskId};
use super::progress::Progress;
use super::state::TaskState;

/// Which stream of which source file a task encodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSelection {
    /// Source file, relative to the shared folder.
    pub source_file: String,
    pub stream_index: u32,
}

/// Stream-specific part of a task.
///
/// Only the command builder looks at the variant; everything else works on
/// the shared fields of `Task`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    Audio,
    Video {
        /// Number of encoding passes.
        step_count: u32,
    },
}

impl TaskKind {
    pub fn step_count(&self) -> u32 {
        match self {
            TaskKind::Audio => 1,
            TaskKind::Video { step_count } => (*step_count).max(1),
        }
    }
}

/// One segment (or one whole stream) of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub job_id: JobId,

    /// Position in the job; also the part number of the output.
    pub index: u32,

    pub stream: StreamSelection,

    /// Encoding window in the source, milliseconds.
    pub start_ms: u64,
    pub end_ms: u64,

    /// Output part path, relative to the shared folder.
    pub output_file: String,

    pub kind: TaskKind,
}

impl Task {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }

    pub fn is_video(&self) -> bool {
        matches!(self.kind, TaskKind::Video { .. })
    }

    /// File the encoder writes inside the node's work dir, keeping the
    /// extension of `output_file`.
    pub fn scratch_file_name(&self) -> String {
        match Path::new(&self.output_file).extension() {
            Some(ext) => format!("{}.{}", self.task_id, ext.to_string_lossy()),
            None => self.task_id.to_string(),
        }
    }
}

/// A task bound to the node executing it, with live progress.
///
/// This is the record the coordinator keeps per task and the payload of
/// `ADD_TASK`; the worker keeps its own copy while encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTask {
    pub task: Task,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,

    pub progress: Progress,
}

impl ClientTask {
    /// Fresh TODO record. `units_total` is frames for video and seconds for
    /// audio.
    pub fn new(task: Task, units_total: u64) -> Self {
        let steps = task.kind.step_count();
        Self {
            task,
            node: None,
            progress: Progress::new(units_total, steps),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.task_id
    }

    pub fn job_id(&self) -> JobId {
        self.task.job_id
    }

    pub fn state(&self) -> TaskState {
        self.progress.state
    }

    /// Back to runnable: no node, fresh progress.
    pub fn release(&mut self) {
        self.node = None;
        self.progress.reset();
    }
}

/// Identity is the task id; progress and binding change over time.
impl PartialEq for ClientTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.task_id == other.task.task_id
    }
}

impl Eq for ClientTask {}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn client_tasks_compare_by_task_id() {
        let job_id = JobId::generate();
        let a = video_task(job_id, 0, 1);
        let mut b = a.clone();
        b.progress.update(10);
        b.node = Some(NodeId::generate());

        assert_eq!(a, b);
        assert_ne!(a, video_task(job_id, 0, 1));
    }

    #[test]
    fn step_count_comes_from_kind() {
        let job_id = JobId::generate();
        assert_eq!(video_task(job_id, 0, 2).progress.step_count, 2);
        assert_eq!(audio_task(job_id, 1).progress.step_count, 1);
    }

    #[test]
    fn kind_is_tagged_in_json() {
        let v = serde_json::to_value(TaskKind::Video { step_count: 2 }).unwrap();
        assert_eq!(v["kind"], "video");
        assert_eq!(v["step_count"], 2);
    }

    #[test]
    fn scratch_file_keeps_output_extension() {
        let t = video_task(JobId::generate(), 3, 1);
        let name = t.task.scratch_file_name();
        assert!(name.starts_with("task-"));
        assert!(name.ends_with(".ts"));
    }

    #[test]
    fn release_unbinds_and_resets() {
        let mut t = video_task(JobId::generate(), 0, 1);
        t.node = Some(NodeId::generate());
        t.progress.start();
        t.progress.update(50);

        t.release();

        assert!(t.node.is_none());
        assert_eq!(t.state(), TaskState::Todo);
        assert_eq!(t.progress.units, 0);
    }
}
