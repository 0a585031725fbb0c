//! OutputFinalizer port - 完成したパートの配置

use std::path::Path;

use async_trait::async_trait;

use crate::domain::Task;
use crate::ports::ExecError;

#[async_trait]
pub trait OutputFinalizer: Send + Sync {
    /// Move the finished scratch output of `task` out of `work_dir` to its
    /// final location. An error fails the task.
    async fn finalize(&self, task: &Task, work_dir: &Path) -> Result<(), ExecError>;
}
