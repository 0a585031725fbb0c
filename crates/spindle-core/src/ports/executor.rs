//! CommandExecutor / ProgressParser port - 外部プロセス実行の抽象化
//!
//! エンコーダー本体（ffmpeg など）の起動と、その出力行の解釈を分離する。
//! Worker はこの二つを組み合わせて進捗を追う。

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use crate::pool::Interrupt;

#[derive(Debug, Error)]
pub enum ExecError {
    /// The program could not be found on this node.
    #[error("binary not found: {0}")]
    MissingBinary(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("interrupted")]
    Interrupted,
}

/// Runs one external command to completion.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `args[0]` with the remaining args inside `work_dir`, handing every
    /// output line to `on_line`.
    ///
    /// `Ok(true)` on a zero exit status, `Ok(false)` on any other exit. When
    /// `interrupt` fires the process is killed and `Err(Interrupted)` returned.
    async fn run(
        &self,
        args: &[String],
        work_dir: &Path,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        interrupt: Interrupt,
    ) -> Result<bool, ExecError>;
}

/// What one output line says about the running command.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Units(u64),
    UnitsAndSpeed { units: u64, speed: f64 },
    /// The encoder cannot handle a codec the task needs.
    MissingDecoder(String),
    None,
}

/// ProgressParser は出力行を ProgressEvent に変換
pub trait ProgressParser: Send + Sync {
    fn parse(&self, line: &str) -> ProgressEvent;
}
