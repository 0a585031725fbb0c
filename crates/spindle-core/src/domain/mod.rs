//! Domain - ドメインモデル
//!
//! ids, job, task, progress, node, report, state。
//! ここはデータと状態遷移だけで、ロック・spawn・I/O は持たない。
//! 同期はコーディネーターとワーカー側が被せる。

pub mod ids;
pub mod job;
pub mod node;
pub mod progress;
pub mod report;
pub mod state;
pub mod task;

pub use ids::{JobId, NodeId, TaskId};
pub use job::{Job, JobOrderKey, JobSpec};
pub use node::Node;
pub use progress::Progress;
pub use report::{Cause, CauseKind, CrashReport, StatusReport, TaskSnapshot};
pub use state::{JobState, NodeHealth, NodeStatus, TaskState};
pub use task::{ClientTask, StreamSelection, Task, TaskKind};
