use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{Pool, PoolError, PoolId, PoolListener, PoolRunner};

/// Rotating set of pools sharing one runner.
///
/// New pools are created on demand up to `max_pools`; `reap` removes the ones
/// that stayed idle past the threshold.
pub struct PoolGroup<T> {
    pools: Mutex<Vec<Pool<T>>>,
    runner: Arc<dyn PoolRunner<T>>,
    listener: Arc<dyn PoolListener>,
    max_pools: usize,
    idle_threshold: Duration,
    next_id: AtomicU32,
}

impl<T> PoolGroup<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    pub fn new(
        runner: Arc<dyn PoolRunner<T>>,
        listener: Arc<dyn PoolListener>,
        max_pools: usize,
        idle_threshold: Duration,
    ) -> Self {
        Self {
            pools: Mutex::new(Vec::new()),
            runner,
            listener,
            max_pools,
            idle_threshold,
            next_id: AtomicU32::new(0),
        }
    }

    fn pools(&self) -> MutexGuard<'_, Vec<Pool<T>>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give `work` to a free pool, spawning one if there is room.
    /// Returns false when every slot is taken.
    pub fn handle(&self, work: T) -> bool {
        let mut pools = self.pools();
        if pools.iter().any(|pool| pool.submit(work.clone())) {
            return true;
        }
        if pools.len() >= self.max_pools {
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let pool = Pool::spawn(
            id,
            Arc::clone(&self.runner),
            Arc::clone(&self.listener),
            self.idle_threshold,
        );
        let submitted = pool.submit(work);
        pools.push(pool);
        tracing::debug!(pool_id = id, pools = pools.len(), "pool spawned");
        submitted
    }

    /// Close and drop every stale idle pool. Returns how many went away.
    pub fn reap(&self) -> usize {
        let mut pools = self.pools();
        let before = pools.len();
        pools.retain(|pool| !pool.clean());
        before - pools.len()
    }

    /// Cancel `work` in whichever pool runs it.
    pub fn cancel(&self, work: &T) -> Result<(), PoolError> {
        let pools = self.pools();
        let pool = pools
            .iter()
            .find(|pool| pool.current().as_ref() == Some(work))
            .ok_or(PoolError::NotInFlight)?;
        pool.cancel(work)
    }

    /// Units currently occupying a slot.
    pub fn in_flight(&self) -> Vec<T> {
        self.pools().iter().filter_map(Pool::current).collect()
    }

    pub fn pool_count(&self) -> usize {
        self.pools().len()
    }

    pub fn max_pools(&self) -> usize {
        self.max_pools
    }

    /// Slots that can take work right now, counting pools not yet spawned.
    pub fn free_slots(&self) -> usize {
        let pools = self.pools();
        let busy = pools.iter().filter(|pool| pool.is_active()).count();
        self.max_pools.saturating_sub(busy)
    }

    /// Stop every pool and wait for their tasks.
    pub async fn shutdown(&self) {
        let pools: Vec<Pool<T>> = std::mem::take(&mut *self.pools());
        for pool in &pools {
            pool.stop();
        }
        for pool in &pools {
            pool.shutdown().await;
        }
    }

    #[cfg(test)]
    fn pool_ids(&self) -> Vec<PoolId> {
        self.pools().iter().map(Pool::id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::test_support::{CountingListener, GatedRunner};

    fn group(max: usize, idle: Duration) -> (PoolGroup<u32>, Arc<GatedRunner>, Arc<CountingListener>) {
        let runner = GatedRunner::new();
        let listener = Arc::new(CountingListener::default());
        let group = PoolGroup::new(
            Arc::clone(&runner) as Arc<dyn PoolRunner<u32>>,
            Arc::clone(&listener) as Arc<dyn PoolListener>,
            max,
            idle,
        );
        (group, runner, listener)
    }

    #[tokio::test]
    async fn spawns_up_to_max_then_refuses() {
        let (group, runner, listener) = group(2, Duration::from_secs(60));

        assert!(group.handle(1));
        assert!(group.handle(2));
        assert!(!group.handle(3));
        assert_eq!(group.pool_count(), 2);
        assert_eq!(group.free_slots(), 0);

        runner.release.notify_one();
        listener.wait_for(1).await;
        assert_eq!(group.free_slots(), 1);
        // the freed pool is reused instead of spawning a third
        assert!(group.handle(4));
        assert_eq!(group.pool_ids(), vec![0, 1]);

        group.shutdown().await;
    }

    #[tokio::test]
    async fn reap_drops_only_idle_pools() {
        let (group, runner, listener) = group(2, Duration::ZERO);

        assert!(group.handle(1));
        assert!(group.handle(2));
        runner.release.notify_one();
        listener.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(group.reap(), 1);
        assert_eq!(group.pool_count(), 1);
        assert_eq!(group.in_flight().len(), 1);

        group.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_unknown_work_is_not_in_flight() {
        let (group, _runner, _listener) = group(1, Duration::from_secs(60));
        assert_eq!(group.cancel(&9), Err(PoolError::NotInFlight));

        assert!(group.handle(9));
        assert_eq!(group.cancel(&9), Err(PoolError::CancelUnsupported));
        group.shutdown().await;
    }
}
