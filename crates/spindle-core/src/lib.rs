//! spindle-core
//!
//! 分散トランスコードクラスタの部品。コーディネーターがジョブをタスクに分けて
//! ワーカーノードへ配り、ワーカーはリソースプールでエンコーダーを動かす。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, task, progress, node, report, state）
//! - **protocol**: フレーム付き JSON のワイヤプロトコル
//! - **pool**: ワーカー側のリソースプール
//! - **dispatch**: ノードごとのディスパッチレーン
//! - **scheduler**: コーディネーター本体
//! - **worker**: ワーカーノード
//! - **ports / impls**: 外部依存（時刻、ID、プロセス、ファイル）の抽象と実装
//! - **app**: 起動とワイヤリング

pub mod app;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod pool;
pub mod ports;
pub mod protocol;
pub mod scheduler;
pub mod worker;

pub use error::{Result, SpindleError};
