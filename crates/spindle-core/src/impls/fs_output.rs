//! FsOutputFinalizer - 完成パートを共有フォルダへ移動

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::Task;
use crate::ports::{ExecError, OutputFinalizer};

/// Moves `<work_dir>/<scratch>` to `<shared_folder>/<task.output_file>`.
#[derive(Debug, Clone)]
pub struct FsOutputFinalizer {
    shared_folder: PathBuf,
}

impl FsOutputFinalizer {
    pub fn new(shared_folder: impl Into<PathBuf>) -> Self {
        Self {
            shared_folder: shared_folder.into(),
        }
    }

    pub fn destination(&self, task: &Task) -> PathBuf {
        self.shared_folder.join(&task.output_file)
    }
}

#[async_trait]
impl OutputFinalizer for FsOutputFinalizer {
    async fn finalize(&self, task: &Task, work_dir: &Path) -> Result<(), ExecError> {
        let source = work_dir.join(task.scratch_file_name());
        let destination = self.destination(task);
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // rename fails across file systems; fall back to copy + remove
        if let Err(e) = tokio::fs::rename(&source, &destination).await {
            tracing::debug!(error = %e, "rename failed, copying part instead");
            tokio::fs::copy(&source, &destination).await?;
            tokio::fs::remove_file(&source).await?;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&destination, std::fs::Permissions::from_mode(0o664))
                .await?;
        }

        tracing::debug!(task_id = %task.task_id, destination = %destination.display(), "part finalized");
        Ok(())
    }
}
