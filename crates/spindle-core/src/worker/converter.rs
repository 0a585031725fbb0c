use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use super::{LiveTasks, TaskReporter, Toolchain};
use crate::domain::{Cause, CauseKind, ClientTask, CrashReport, NodeId, StatusReport, Task, TaskId};
use crate::pool::{Interrupt, PoolError, PoolRunner};
use crate::ports::{ExecError, ProgressEvent};
use crate::protocol::{Message, TaskUpdate};

/// How one task ended on this node.
#[derive(Debug, Clone, PartialEq)]
enum RunOutcome {
    Completed,
    Failed(String),
    Interrupted,
    Crashed(Cause),
}

/// Runs transcode tasks inside pool slots.
///
/// Every pass of a task is one encoder invocation. Progress parsed from the
/// encoder output lands in `LiveTasks` and is pushed to the coordinator on a
/// fixed interval. Exactly one outcome message is sent per task.
pub struct TranscodeRunner {
    node_id: NodeId,
    total_slots: u32,
    work_dir: PathBuf,
    progress_interval: Duration,
    tools: Toolchain,
    reporter: Arc<dyn TaskReporter>,
    live: LiveTasks,
    cancels: Mutex<HashMap<TaskId, Arc<watch::Sender<bool>>>>,
}

impl TranscodeRunner {
    pub fn new(
        node_id: NodeId,
        total_slots: u32,
        work_dir: PathBuf,
        progress_interval: Duration,
        tools: Toolchain,
        reporter: Arc<dyn TaskReporter>,
        live: LiveTasks,
    ) -> Self {
        Self {
            node_id,
            total_slots,
            work_dir,
            progress_interval,
            tools,
            reporter,
            live,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    fn cancels(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<watch::Sender<bool>>>> {
        self.cancels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport::new(self.node_id, self.live.snapshots(), self.total_slots)
    }

    async fn transcode(&self, task: &Task, interrupt: Interrupt) -> RunOutcome {
        let task_id = task.task_id;
        let steps = task.kind.step_count();

        for step in 1..=steps {
            let args = self.tools.builder.build(task, step);
            tracing::debug!(%task_id, step, steps, "starting encoder pass");

            let mut missing_codec: Option<String> = None;
            let live = &self.live;
            let parser = self.tools.parser.as_ref();
            let mut on_line = |line: &str| match parser.parse(line) {
                ProgressEvent::Units(units) => live.update(task_id, |t| t.progress.update(units)),
                ProgressEvent::UnitsAndSpeed { units, speed } => {
                    live.update(task_id, |t| t.progress.update_with_speed(units, speed))
                }
                ProgressEvent::MissingDecoder(message) => {
                    missing_codec.get_or_insert(message);
                }
                ProgressEvent::None => {}
            };

            let result = self
                .tools
                .executor
                .run(&args, &self.work_dir, &mut on_line, interrupt.clone())
                .await;
            match result {
                Ok(true) => {}
                Ok(false) => {
                    return match missing_codec {
                        Some(message) => {
                            RunOutcome::Crashed(Cause::new(CauseKind::MissingDecoder, message, true))
                        }
                        None => RunOutcome::Failed(format!("encoder failed on pass {step}/{steps}")),
                    };
                }
                Err(ExecError::MissingBinary(binary)) => {
                    return RunOutcome::Crashed(Cause::new(
                        CauseKind::MissingBinary,
                        format!("{binary} is not installed"),
                        true,
                    ));
                }
                Err(ExecError::Interrupted) => return RunOutcome::Interrupted,
                Err(ExecError::Io(e)) => return RunOutcome::Failed(format!("io: {e}")),
            }

            live.update(task_id, |t| t.progress.complete_step());
        }

        if interrupt.is_interrupted() {
            return RunOutcome::Interrupted;
        }
        match self.tools.finalizer.finalize(task, &self.work_dir).await {
            Ok(()) => RunOutcome::Completed,
            Err(e) => RunOutcome::Failed(format!("finalizing output: {e}")),
        }
    }

    fn publish_progress(&self, task_id: TaskId) {
        let Some(task) = self.live.get(task_id) else {
            return;
        };
        let message = Message::TaskProgress(TaskUpdate::new(self.node_id, &task));
        let reporter = Arc::clone(&self.reporter);
        tokio::spawn(async move {
            if let Err(e) = reporter.report(message).await {
                tracing::debug!(%task_id, error = %e, "progress report not delivered");
            }
        });
    }

    async fn finish(&self, task_id: TaskId, outcome: RunOutcome) {
        let status = self.status_report();
        let Some(mut task) = self.live.get(task_id) else {
            tracing::warn!(%task_id, "finished task was not live");
            return;
        };

        let message = match outcome {
            RunOutcome::Completed => {
                task.progress.complete();
                tracing::info!(%task_id, "task completed");
                Message::TaskCompleted(TaskUpdate::new(self.node_id, &task))
            }
            RunOutcome::Failed(reason) => {
                task.progress.fail();
                tracing::warn!(%task_id, %reason, "task failed");
                Message::TaskFailed(TaskUpdate::new(self.node_id, &task).with_reason(reason))
            }
            RunOutcome::Interrupted => {
                tracing::info!(%task_id, "task interrupted");
                Message::TaskInterrupted(TaskUpdate::new(self.node_id, &task))
            }
            RunOutcome::Crashed(cause) => {
                tracing::error!(%task_id, kind = ?cause.kind, message = %cause.message, "node crash");
                Message::NodeCrash(CrashReport::new(self.node_id, cause, status, Some(task_id)))
            }
        };

        let route = message.route();
        if let Err(e) = self.reporter.report(message).await {
            tracing::warn!(%task_id, %route, error = %e, "could not report task outcome");
        }
        // status reports keep showing the task until its outcome is out
        self.live.remove(task_id);
    }
}

#[async_trait]
impl PoolRunner<ClientTask> for TranscodeRunner {
    async fn run(&self, task: ClientTask, mut interrupt: Interrupt) {
        let task_id = task.task_id();
        let (cancel_tx, cancel_rx) = watch::channel(interrupt.is_interrupted());
        let cancel_tx = Arc::new(cancel_tx);
        self.cancels().insert(task_id, Arc::clone(&cancel_tx));
        self.live.update(task_id, |t| t.progress.start());
        tracing::info!(%task_id, job_id = %task.job_id(), "task started");

        let exec = self.transcode(&task.task, Interrupt::new(cancel_rx));
        tokio::pin!(exec);
        let mut ticker = tokio::time::interval(self.progress_interval);
        // the first tick fires immediately
        ticker.tick().await;
        let mut forwarded = false;

        let outcome = loop {
            tokio::select! {
                outcome = &mut exec => break outcome,
                _ = interrupt.interrupted(), if !forwarded => {
                    forwarded = true;
                    let _ = cancel_tx.send(true);
                }
                _ = ticker.tick() => self.publish_progress(task_id),
            }
        };

        self.cancels().remove(&task_id);
        self.finish(task_id, outcome).await;
    }

    fn cancel(&self, task: &ClientTask) -> Result<(), PoolError> {
        let cancels = self.cancels();
        let tx = cancels
            .get(&task.task_id())
            .ok_or(PoolError::NotInFlight)?;
        let _ = tx.send(true);
        tracing::info!(task_id = %task.task_id(), "task cancel requested");
        Ok(())
    }
}
