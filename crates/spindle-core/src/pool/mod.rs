//! Pool - ワーカー側のリソースプール
//!
//! `Pool` は専用の tokio タスクを持つ 1 スロットの実行コンテキスト。
//! 作業は最大 1 件で、使用中の `submit` はキューせずに即座に失敗する。
//! `PoolGroup` は複数のプールを回し、アイドルが長いものを回収する。

mod group;
mod pooler;

pub use group::PoolGroup;
pub use pooler::Pool;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

/// Pool identifier, unique within a `PoolGroup`.
pub type PoolId = u32;

/// Executes the work a pool receives.
///
/// `run` is awaited on the pool's own task, so the submitter never runs the
/// work itself. It must report the unit's outcome itself (completed, failed,
/// interrupted); the pool only tells its listener that the slot is free.
#[async_trait]
pub trait PoolRunner<T>: Send + Sync + 'static {
    async fn run(&self, work: T, interrupt: Interrupt);

    /// Cancel the unit currently running. Pools call this only for the exact
    /// in-flight unit.
    fn cancel(&self, _work: &T) -> Result<(), PoolError> {
        Err(PoolError::CancelUnsupported)
    }
}

/// Owner of a pool, told whenever the slot frees up.
#[async_trait]
pub trait PoolListener: Send + Sync {
    async fn completed(&self, pool_id: PoolId);
}

/// Stop signal handed to running work.
#[derive(Debug, Clone)]
pub struct Interrupt {
    rx: watch::Receiver<bool>,
}

impl Interrupt {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Handle that never fires, for running work outside a pool.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // keep the value readable after the sender is gone
        drop(tx);
        Self { rx }
    }

    pub fn is_interrupted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop is requested. Pending forever if the pool is gone
    /// without having been stopped.
    pub async fn interrupted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("work is not running in this pool")]
    NotInFlight,

    #[error("cancelling in-flight work is not supported by this pool")]
    CancelUnsupported,
}
