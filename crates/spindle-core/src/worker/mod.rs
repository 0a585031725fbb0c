//! Worker node - タスクを受け取り、プールでエンコードする
//!
//! - **WorkerServer**: ADD_TASK / DELETE_TASK / STATUS_REQUEST を受け付ける
//! - **WorkerNode**: 受け付けたタスクを PoolGroup に渡す
//! - **TranscodeRunner**: プール内で 1 タスクを全パス実行し、結果を報告する
//! - **LiveTasks**: 実行中タスクと進捗の共有ビュー
//! - **TaskReporter**: 結果の送り先。本番はコーディネーターへ送る `CoordinatorLink`

mod converter;
mod live;
mod node;
mod reporter;
mod server;

use std::sync::Arc;

pub use converter::TranscodeRunner;
pub use live::LiveTasks;
pub use node::WorkerNode;
pub use reporter::{CoordinatorLink, TaskReporter};
pub use server::WorkerServer;

use crate::ports::{CommandBuilder, CommandExecutor, OutputFinalizer, ProgressParser};

/// Everything needed to turn a task into an output part.
#[derive(Clone)]
pub struct Toolchain {
    pub executor: Arc<dyn CommandExecutor>,
    pub builder: Arc<dyn CommandBuilder>,
    pub parser: Arc<dyn ProgressParser>,
    pub finalizer: Arc<dyn OutputFinalizer>,
}
