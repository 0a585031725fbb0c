//! CommandBuilder port - エンコード引数の組み立て
//!
//! コーデックやオプションの選択はこの trait の実装に閉じ込める。

use crate::domain::Task;

pub trait CommandBuilder: Send + Sync {
    /// Full argument list (program first) for pass `step` (1-based) of `task`.
    ///
    /// The command must write its result to `Task::scratch_file_name` inside
    /// the executor's work dir; the output finalizer picks it up from there.
    fn build(&self, task: &Task, step: u32) -> Vec<String>;
}
