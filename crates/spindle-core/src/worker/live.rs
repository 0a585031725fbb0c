use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::domain::{ClientTask, TaskId, TaskSnapshot};

/// Tasks this node has accepted and not yet reported a final outcome for.
///
/// Shared between the server (which adds tasks), the runner (which updates
/// progress from encoder output) and status reports.
#[derive(Clone, Default)]
pub struct LiveTasks {
    inner: Arc<Mutex<HashMap<TaskId, ClientTask>>>,
}

impl LiveTasks {
    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, ClientTask>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `false` if a task with the same id is already live.
    pub fn insert_if_absent(&self, task: ClientTask) -> bool {
        let mut tasks = self.lock();
        if tasks.contains_key(&task.task_id()) {
            return false;
        }
        tasks.insert(task.task_id(), task);
        true
    }

    pub fn remove(&self, task_id: TaskId) -> Option<ClientTask> {
        self.lock().remove(&task_id)
    }

    pub fn get(&self, task_id: TaskId) -> Option<ClientTask> {
        self.lock().get(&task_id).cloned()
    }

    pub fn update(&self, task_id: TaskId, f: impl FnOnce(&mut ClientTask)) {
        if let Some(task) = self.lock().get_mut(&task_id) {
            f(task);
        }
    }

    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        self.lock()
            .values()
            .map(|t| TaskSnapshot {
                task_id: t.task_id(),
                job_id: t.job_id(),
                progress: t.progress.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
