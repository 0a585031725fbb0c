//! Config - コーディネーターとワーカーノードの設定
//!
//! どちらも JSON から読み込み、省略したフィールドは既定値になる。
//! 時間はすべてミリ秒の整数で持つ。

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::RpcTimeouts;

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7070))
}

fn default_worker_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7071))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub listen_addr: SocketAddr,

    pub connect_timeout_ms: u64,
    /// Bound on waiting for the reply of one request.
    pub response_timeout_ms: u64,

    /// Items a dispatch lane buffers before `enqueue` refuses.
    pub lane_depth: usize,

    pub schedule_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Heartbeats use their own, shorter, response bound.
    pub heartbeat_timeout_ms: u64,

    /// Quarantine a node after this many environment crashes. `None` keeps
    /// suspect nodes in rotation.
    pub quarantine_after: Option<u32>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_timeout_ms: 2_000,
            response_timeout_ms: 10_000,
            lane_depth: 1,
            schedule_interval_ms: 500,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 2_000,
            quarantine_after: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn rpc_timeouts(&self) -> RpcTimeouts {
        RpcTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            response: Duration::from_millis(self.response_timeout_ms),
        }
    }

    pub fn heartbeat_timeouts(&self) -> RpcTimeouts {
        RpcTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            response: Duration::from_millis(self.heartbeat_timeout_ms),
        }
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub name: String,
    pub listen_addr: SocketAddr,
    pub coordinator_addr: SocketAddr,

    /// Folder shared with the coordinator: sources in, parts out.
    pub shared_folder: PathBuf,
    /// Node-local scratch folder for encoder output.
    pub work_dir: PathBuf,

    pub encoder_binary: String,
    /// Appended to every encoder command after the stream mapping.
    pub encoder_args: Vec<String>,

    pub max_pools: usize,
    pub pool_idle_threshold_ms: u64,
    pub reap_interval_ms: u64,
    pub progress_interval_ms: u64,

    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            listen_addr: default_worker_addr(),
            coordinator_addr: default_listen_addr(),
            shared_folder: PathBuf::from("shared"),
            work_dir: std::env::temp_dir().join("spindle"),
            encoder_binary: "ffmpeg".to_string(),
            encoder_args: Vec::new(),
            max_pools: 1,
            pool_idle_threshold_ms: 60_000,
            reap_interval_ms: 5_000,
            progress_interval_ms: 1_000,
            connect_timeout_ms: 2_000,
            response_timeout_ms: 10_000,
        }
    }
}

impl WorkerConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn rpc_timeouts(&self) -> RpcTimeouts {
        RpcTimeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            response: Duration::from_millis(self.response_timeout_ms),
        }
    }

    pub fn pool_idle_threshold(&self) -> Duration {
        Duration::from_millis(self.pool_idle_threshold_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let c = CoordinatorConfig::from_json_str("{}").unwrap();
        assert_eq!(c.rpc_timeouts(), RpcTimeouts::default());
        assert_eq!(c.lane_depth, 1);
        assert_eq!(c.quarantine_after, None);

        let w = WorkerConfig::from_json_str("{}").unwrap();
        assert_eq!(w.max_pools, 1);
        assert_eq!(w.pool_idle_threshold(), Duration::from_secs(60));
        assert_eq!(w.reap_interval(), Duration::from_secs(5));
    }

    #[test]
    fn partial_json_overrides_only_given_fields() {
        let c = CoordinatorConfig::from_json_str(
            r#"{"response_timeout_ms": 500, "quarantine_after": 3}"#,
        )
        .unwrap();
        assert_eq!(c.rpc_timeouts().response, Duration::from_millis(500));
        assert_eq!(c.rpc_timeouts().connect, Duration::from_millis(2_000));
        assert_eq!(c.quarantine_after, Some(3));
    }

    #[test]
    fn bad_json_is_a_config_error() {
        let err = WorkerConfig::from_json_str(r#"{"max_pools": "many"}"#).unwrap_err();
        assert!(err.to_string().contains("invalid configuration"));
    }
}
