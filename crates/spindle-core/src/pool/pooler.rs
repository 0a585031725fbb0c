use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use super::{Interrupt, PoolError, PoolId, PoolListener, PoolRunner};

struct Slot<T> {
    /// Unit occupying the slot, from `submit` until the runner returns.
    current: Option<T>,
    /// Unit handed over but not yet picked up by the run loop.
    pending: Option<T>,
    last_activity: Instant,
    closed: bool,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    wake: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        // Slot updates are single assignments, a poisoned guard is still consistent.
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn next_work(&self) -> T {
        loop {
            let pending = self.lock().pending.take();
            if let Some(work) = pending {
                return work;
            }
            self.wake.notified().await;
        }
    }

    fn release(&self) {
        let mut slot = self.lock();
        slot.current = None;
        slot.last_activity = Instant::now();
    }
}

/// One execution slot backed by its own tokio task.
pub struct Pool<T> {
    id: PoolId,
    shared: Arc<Shared<T>>,
    runner: Arc<dyn PoolRunner<T>>,
    idle_threshold: Duration,
    stop_tx: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Pool<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// Start the pool's task. Must be called inside a tokio runtime.
    pub fn spawn(
        id: PoolId,
        runner: Arc<dyn PoolRunner<T>>,
        listener: Arc<dyn PoolListener>,
        idle_threshold: Duration,
    ) -> Self {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                current: None,
                pending: None,
                last_activity: Instant::now(),
                closed: false,
            }),
            wake: Notify::new(),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(run_loop(
            id,
            Arc::clone(&shared),
            Arc::clone(&runner),
            listener,
            stop_rx,
        ));

        Self {
            id,
            shared,
            runner,
            idle_threshold,
            stop_tx,
            join: Mutex::new(Some(join)),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Hand `work` to the pool. Returns false, without blocking, when the
    /// slot is taken or the pool is closed.
    pub fn submit(&self, work: T) -> bool {
        let mut slot = self.shared.lock();
        if slot.closed || slot.current.is_some() {
            return false;
        }
        slot.current = Some(work.clone());
        slot.pending = Some(work);
        slot.last_activity = Instant::now();
        drop(slot);

        self.shared.wake.notify_one();
        true
    }

    pub fn is_active(&self) -> bool {
        self.shared.lock().current.is_some()
    }

    pub fn is_idle(&self) -> bool {
        !self.is_active()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn current(&self) -> Option<T> {
        self.shared.lock().current.clone()
    }

    /// Idle, open, and untouched for longer than the idle threshold.
    pub fn should_clean(&self) -> bool {
        let slot = self.shared.lock();
        Self::is_stale(&slot, self.idle_threshold)
    }

    /// Close the pool if `should_clean`. The check and the close happen under
    /// one lock so a concurrent `submit` either lands first or is refused.
    pub fn clean(&self) -> bool {
        let mut slot = self.shared.lock();
        if !Self::is_stale(&slot, self.idle_threshold) {
            return false;
        }
        slot.closed = true;
        drop(slot);

        let _ = self.stop_tx.send(true);
        tracing::debug!(pool_id = self.id, "idle pool cleaned");
        true
    }

    /// Close the pool and interrupt whatever it is running.
    pub fn stop(&self) {
        self.shared.lock().closed = true;
        let _ = self.stop_tx.send(true);
    }

    /// Cancel `work` if it is the unit currently in the slot.
    pub fn cancel(&self, work: &T) -> Result<(), PoolError> {
        let in_flight = self.shared.lock().current.as_ref() == Some(work);
        if !in_flight {
            return Err(PoolError::NotInFlight);
        }
        self.runner.cancel(work)
    }

    /// Stop and wait for the pool's task to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                tracing::warn!(pool_id = self.id, error = %e, "pool task ended abnormally");
            }
        }
    }

    fn is_stale(slot: &Slot<T>, threshold: Duration) -> bool {
        !slot.closed && slot.current.is_none() && slot.last_activity.elapsed() > threshold
    }
}

async fn run_loop<T>(
    id: PoolId,
    shared: Arc<Shared<T>>,
    runner: Arc<dyn PoolRunner<T>>,
    listener: Arc<dyn PoolListener>,
    mut stop_rx: watch::Receiver<bool>,
) where
    T: Send + 'static,
{
    loop {
        if *stop_rx.borrow() {
            break;
        }
        let work = tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            work = shared.next_work() => work,
        };
        execute(id, &shared, runner.as_ref(), listener.as_ref(), work, &stop_rx).await;
    }

    // A unit accepted just before the stop still gets a run; the runner sees
    // the interrupt already raised and reports it as interrupted.
    let leftover = shared.lock().pending.take();
    if let Some(work) = leftover {
        execute(id, &shared, runner.as_ref(), listener.as_ref(), work, &stop_rx).await;
    }
    tracing::debug!(pool_id = id, "pool stopped");
}

async fn execute<T>(
    id: PoolId,
    shared: &Shared<T>,
    runner: &dyn PoolRunner<T>,
    listener: &dyn PoolListener,
    work: T,
    stop_rx: &watch::Receiver<bool>,
) where
    T: Send + 'static,
{
    let interrupt = Interrupt::new(stop_rx.clone());
    let outcome = AssertUnwindSafe(runner.run(work, interrupt))
        .catch_unwind()
        .await;
    if outcome.is_err() {
        tracing::error!(pool_id = id, "pool work panicked");
    }

    shared.release();
    listener.completed(id).await;
}
