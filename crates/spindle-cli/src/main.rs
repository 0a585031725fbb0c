use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{Duration, sleep};
use tracing_subscriber::EnvFilter;

use spindle_core::app::{CoordinatorBuilder, WorkerBuilder};
use spindle_core::config::{CoordinatorConfig, WorkerConfig};
use spindle_core::domain::{
    ClientTask, Job, JobSpec, JobState, Node, NodeId, StreamSelection, Task, TaskKind,
};
use spindle_core::impls::{FfmpegCommandBuilder, FfmpegProgressParser};
use spindle_core::pool::Interrupt;
use spindle_core::ports::{CommandExecutor, ExecError, OutputFinalizer};
use spindle_core::scheduler::Coordinator;
use spindle_core::worker::Toolchain;

/// Pretends to be ffmpeg: prints a status line every 100 ms for one second
/// per pass.
struct SimulatedEncoder;

#[async_trait]
impl CommandExecutor for SimulatedEncoder {
    async fn run(
        &self,
        args: &[String],
        _work_dir: &Path,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        mut interrupt: Interrupt,
    ) -> Result<bool, ExecError> {
        tracing::debug!(command = %args.join(" "), "simulated encoder started");
        for tick in 1..=10u64 {
            tokio::select! {
                _ = sleep(Duration::from_millis(100)) => {}
                _ = interrupt.interrupted() => return Err(ExecError::Interrupted),
            }
            on_line(&format!(
                "frame={} fps=144 q=28.0 time=00:00:{:02}.00 speed=6.0x",
                tick * 144,
                tick * 6
            ));
        }
        Ok(true)
    }
}

/// Leaves the (simulated) output where it is.
struct Discard;

#[async_trait]
impl OutputFinalizer for Discard {
    async fn finalize(&self, task: &Task, _work_dir: &Path) -> Result<(), ExecError> {
        tracing::debug!(task_id = %task.task_id, output = %task.output_file, "output ready");
        Ok(())
    }
}

fn demo_job(coordinator: &Coordinator) -> Job {
    let spec = JobSpec {
        name: "big-buck-bunny".to_string(),
        source_file: "movies/big-buck-bunny.mkv".to_string(),
        priority: 0,
        duration_ms: 180_000,
        frame_rate: 24.0,
        frame_count: None,
        output_root: "out".to_string(),
    };
    let mut job = coordinator.new_job(spec);
    let parts = format!("{}/{}", job.output_folder, job.parts_folder);

    for index in 0..3u32 {
        let task = Task {
            task_id: coordinator.new_task_id(),
            job_id: job.job_id,
            index,
            stream: StreamSelection {
                source_file: job.source_file.clone(),
                stream_index: 0,
            },
            start_ms: u64::from(index) * 60_000,
            end_ms: u64::from(index + 1) * 60_000,
            output_file: format!("{parts}/{index}/part-{index}.mpeg.ts"),
            kind: TaskKind::Video { step_count: 2 },
        };
        job.add_task(ClientTask::new(task, 1440));
    }

    let audio = Task {
        task_id: coordinator.new_task_id(),
        job_id: job.job_id,
        index: 3,
        stream: StreamSelection {
            source_file: job.source_file.clone(),
            stream_index: 1,
        },
        start_ms: 0,
        end_ms: job.duration_ms,
        output_file: format!("{parts}/3/part-3.ogg"),
        kind: TaskKind::Audio,
    };
    job.add_task(ClientTask::new(audio, job.duration_ms / 1000));
    job
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // (A) coordinator on an ephemeral port
    let coordinator_config = CoordinatorConfig {
        listen_addr: "127.0.0.1:0".parse()?,
        schedule_interval_ms: 100,
        heartbeat_interval_ms: 1_000,
        ..CoordinatorConfig::default()
    };
    let coordinator = CoordinatorBuilder::new(coordinator_config).start().await?;

    // (B) one worker node running the simulated encoder
    let node_id = NodeId::generate();
    let worker_config = WorkerConfig {
        name: "local-encoder".to_string(),
        listen_addr: "127.0.0.1:0".parse()?,
        coordinator_addr: coordinator.local_addr(),
        progress_interval_ms: 250,
        ..WorkerConfig::default()
    };
    let toolchain = Toolchain {
        executor: Arc::new(SimulatedEncoder),
        builder: Arc::new(FfmpegCommandBuilder::new("ffmpeg", &worker_config.shared_folder)),
        parser: Arc::new(FfmpegProgressParser::new()?),
        finalizer: Arc::new(Discard),
    };
    let worker = WorkerBuilder::new(worker_config, node_id)
        .toolchain(toolchain)
        .start()
        .await?;

    // (C) register the node, submit the job
    let c = Arc::clone(coordinator.coordinator());
    c.register_node(Node::new(node_id, "local-encoder", worker.local_addr()))
        .await?;
    let job_id = c.add_job(demo_job(&c)).await;
    tracing::info!(%job_id, "job submitted");

    // (D) poll until the job is done
    loop {
        let job = c.job(job_id).await?;
        let percent: f64 =
            job.tasks.iter().map(|t| t.progress.percent()).sum::<f64>() / job.tasks.len() as f64;
        tracing::info!(%job_id, state = ?job.state, percent = %format!("{percent:.1}"), "progress");
        if job.state == JobState::Completed {
            break;
        }
        sleep(Duration::from_millis(500)).await;
    }
    println!("{}", serde_json::to_string_pretty(&c.counts().await)?);

    // (E) graceful shutdown: worker first, then the coordinator
    worker.shutdown_and_join().await;
    coordinator.shutdown_and_join().await;
    Ok(())
}
