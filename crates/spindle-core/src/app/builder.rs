//! Builders - コーディネーターとワーカーノードの起動とワイヤリング
//!
//! # 起動時検証（Fail-fast 設計）
//! - 設定値の矛盾（スロット 0 など）は bind 前に `BuildError` で返す
//! - bind 失敗もここで返し、起動後のループは失敗しない前提にする

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::loops::{heartbeat_loop, reaper_loop, schedule_loop};
use crate::config::{CoordinatorConfig, WorkerConfig};
use crate::domain::NodeId;
use crate::impls::{FfmpegCommandBuilder, FfmpegProgressParser, FsOutputFinalizer, ProcessExecutor};
use crate::protocol::serve;
use crate::scheduler::{Coordinator, CoordinatorServer};
use crate::worker::{
    CoordinatorLink, LiveTasks, TaskReporter, Toolchain, TranscodeRunner, WorkerNode, WorkerServer,
};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("progress parser: {0}")]
    Parser(#[from] regex::Error),
}

async fn bind(addr: SocketAddr) -> Result<(TcpListener, SocketAddr), BuildError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| BuildError::Bind { addr, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| BuildError::Bind { addr, source })?;
    Ok((listener, local_addr))
}

/// Background tasks sharing one shutdown switch.
/// - `request_shutdown()` で全ループに停止を伝える
/// - `join()` は全タスクの終了を待つ
struct TaskGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            joins: Vec::new(),
        }
    }

    fn receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn push(&mut self, join: JoinHandle<()>) {
        self.joins.push(join);
    }

    fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    async fn join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::warn!(error = %e, "background task ended abnormally");
            }
        }
    }
}

// ========================================
// Coordinator
// ========================================

pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorBuilder {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.config.lane_depth == 0 {
            return Err(BuildError::InvalidConfig("lane_depth must be at least 1".into()));
        }
        if self.config.schedule_interval_ms == 0 || self.config.heartbeat_interval_ms == 0 {
            return Err(BuildError::InvalidConfig("loop intervals must be positive".into()));
        }
        Ok(())
    }

    /// Bind the listen address and start the server, scheduling and
    /// heartbeat loops.
    pub async fn start(self) -> Result<CoordinatorHandle, BuildError> {
        self.validate()?;
        let (listener, local_addr) = bind(self.config.listen_addr).await?;
        let coordinator = Coordinator::new(self.config);

        let mut tasks = TaskGroup::new();
        let server = Arc::new(CoordinatorServer::new(Arc::clone(&coordinator)));
        tasks.push(tokio::spawn(serve(listener, server, tasks.receiver())));
        tasks.push(tokio::spawn(schedule_loop(Arc::clone(&coordinator), tasks.receiver())));
        tasks.push(tokio::spawn(heartbeat_loop(Arc::clone(&coordinator), tasks.receiver())));

        tracing::info!(%local_addr, "coordinator listening");
        Ok(CoordinatorHandle {
            coordinator,
            local_addr,
            tasks,
        })
    }
}

/// Running coordinator.
pub struct CoordinatorHandle {
    coordinator: Arc<Coordinator>,
    local_addr: SocketAddr,
    tasks: TaskGroup,
}

impl CoordinatorHandle {
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn request_shutdown(&self) {
        self.tasks.request_shutdown();
    }

    /// Stop the loops, then the dispatch lanes.
    pub async fn shutdown_and_join(self) {
        self.tasks.join().await;
        self.coordinator.shutdown().await;
        tracing::info!("coordinator stopped");
    }
}

// ========================================
// Worker node
// ========================================

pub struct WorkerBuilder {
    config: WorkerConfig,
    node_id: NodeId,
    tools: Option<Toolchain>,
    reporter: Option<Arc<dyn TaskReporter>>,
}

impl WorkerBuilder {
    /// `node_id` is the id the coordinator registered this node under.
    pub fn new(config: WorkerConfig, node_id: NodeId) -> Self {
        Self {
            config,
            node_id,
            tools: None,
            reporter: None,
        }
    }

    /// Replace the ffmpeg toolchain.
    pub fn toolchain(mut self, tools: Toolchain) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Replace the coordinator link.
    pub fn reporter(mut self, reporter: Arc<dyn TaskReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        if self.config.max_pools == 0 {
            return Err(BuildError::InvalidConfig("max_pools must be at least 1".into()));
        }
        if self.config.reap_interval_ms == 0 || self.config.progress_interval_ms == 0 {
            return Err(BuildError::InvalidConfig("loop intervals must be positive".into()));
        }
        Ok(())
    }

    fn default_toolchain(config: &WorkerConfig) -> Result<Toolchain, BuildError> {
        let builder = FfmpegCommandBuilder::new(&config.encoder_binary, &config.shared_folder)
            .with_extra_args(config.encoder_args.clone());
        Ok(Toolchain {
            executor: Arc::new(ProcessExecutor),
            builder: Arc::new(builder),
            parser: Arc::new(FfmpegProgressParser::new()?),
            finalizer: Arc::new(FsOutputFinalizer::new(&config.shared_folder)),
        })
    }

    /// Bind the listen address and start the server and pool reaper.
    pub async fn start(self) -> Result<WorkerHandle, BuildError> {
        self.validate()?;
        let config = self.config;
        let tools = match self.tools {
            Some(tools) => tools,
            None => Self::default_toolchain(&config)?,
        };
        let reporter = self.reporter.unwrap_or_else(|| {
            Arc::new(CoordinatorLink::new(config.coordinator_addr, config.rpc_timeouts()))
        });
        tokio::fs::create_dir_all(&config.work_dir)
            .await
            .map_err(|e| BuildError::InvalidConfig(format!("work_dir {}: {e}", config.work_dir.display())))?;

        let (listener, local_addr) = bind(config.listen_addr).await?;
        let total_slots = u32::try_from(config.max_pools).unwrap_or(u32::MAX);
        let live = LiveTasks::default();
        let runner = Arc::new(TranscodeRunner::new(
            self.node_id,
            total_slots,
            config.work_dir.clone(),
            config.progress_interval(),
            tools,
            reporter,
            live.clone(),
        ));
        let node = Arc::new(WorkerNode::new(
            self.node_id,
            live,
            runner,
            config.max_pools,
            config.pool_idle_threshold(),
        ));

        let mut tasks = TaskGroup::new();
        let server = Arc::new(WorkerServer::new(Arc::clone(&node)));
        tasks.push(tokio::spawn(serve(listener, server, tasks.receiver())));
        tasks.push(tokio::spawn(reaper_loop(
            Arc::clone(&node),
            config.reap_interval(),
            tasks.receiver(),
        )));

        tracing::info!(node_id = %self.node_id, name = %config.name, %local_addr, "worker listening");
        Ok(WorkerHandle {
            node,
            local_addr,
            tasks,
        })
    }
}

/// Running worker node.
pub struct WorkerHandle {
    node: Arc<WorkerNode>,
    local_addr: SocketAddr,
    tasks: TaskGroup,
}

impl WorkerHandle {
    pub fn node(&self) -> &Arc<WorkerNode> {
        &self.node
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn request_shutdown(&self) {
        self.tasks.request_shutdown();
    }

    /// Stop accepting, then interrupt running tasks and wait for the pools.
    pub async fn shutdown_and_join(self) {
        self.tasks.join().await;
        self.node.shutdown().await;
        tracing::info!(node_id = %self.node.node_id(), "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn zero_slots_fail_fast() {
        let config = WorkerConfig {
            max_pools: 0,
            listen_addr: local(),
            ..WorkerConfig::default()
        };
        let built = WorkerBuilder::new(config, NodeId::generate()).start().await;
        assert!(matches!(built, Err(BuildError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn taken_port_is_a_bind_error() {
        let taken = TcpListener::bind(local()).await.unwrap();
        let config = CoordinatorConfig {
            listen_addr: taken.local_addr().unwrap(),
            ..CoordinatorConfig::default()
        };
        let built = CoordinatorBuilder::new(config).start().await;
        assert!(matches!(built, Err(BuildError::Bind { .. })));
    }

    #[tokio::test]
    async fn coordinator_starts_and_stops() {
        let config = CoordinatorConfig {
            listen_addr: local(),
            ..CoordinatorConfig::default()
        };
        let handle = CoordinatorBuilder::new(config).start().await.unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        assert_eq!(handle.coordinator().counts().await.nodes_free, 0);

        tokio::time::timeout(std::time::Duration::from_secs(2), handle.shutdown_and_join())
            .await
            .unwrap();
    }
}
