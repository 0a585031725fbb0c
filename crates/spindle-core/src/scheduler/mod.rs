//! Scheduler - ジョブ／タスクのスケジューリングとコーディネーターのサーバー

mod coordinator;
mod server;

pub use coordinator::Coordinator;
pub use server::CoordinatorServer;
