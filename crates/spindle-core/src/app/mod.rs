//! App - アプリケーション層
//!
//! scheduler / worker / protocol を組み合わせて、起動可能なプロセスにする。
//!
//! # 主要コンポーネント
//! - **CoordinatorBuilder**: サーバー + スケジュールループ + ハートビート
//! - **WorkerBuilder**: サーバー + プール回収ループ
//! - **loops**: shutdown watch で止まるバックグラウンドループ

pub mod builder;
pub mod loops;

pub use self::builder::{BuildError, CoordinatorBuilder, CoordinatorHandle, WorkerBuilder, WorkerHandle};
