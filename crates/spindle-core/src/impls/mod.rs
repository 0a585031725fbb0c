//! Impls - ports の実装
//!
//! - **ProcessExecutor**: tokio::process でエンコーダーを起動
//! - **FfmpegProgressParser**: ffmpeg のステータス行を解析
//! - **FfmpegCommandBuilder**: 区間・ストリーム・パスだけを指定する最小構成
//! - **FsOutputFinalizer**: 完成パートを共有フォルダへ移動

pub mod ffmpeg_command;
pub mod ffmpeg_progress;
pub mod fs_output;
pub mod process_executor;

pub use self::ffmpeg_command::FfmpegCommandBuilder;
pub use self::ffmpeg_progress::FfmpegProgressParser;
pub use self::fs_output::FsOutputFinalizer;
pub use self::process_executor::ProcessExecutor;
