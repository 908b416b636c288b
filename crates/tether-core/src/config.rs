//! Centralized configuration for the reactor and the IPC layer.
//!
//! Compile-time defaults live in the `*Config` constant structs; the runtime
//! [`TetherConfig`] starts from those defaults, can be loaded from a JSON file
//! and is then overridden from the environment.

use crate::error::{Result, TetherError};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Reactor and IO object defaults.
pub struct IoConfig;

impl IoConfig {
    pub const THROTTLE_LIMIT: usize = 2 * 1024 * 1024; // 2MB
    pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
    pub const MAX_POLL_MS: u64 = 1000;
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 10_000;
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;
    pub const FILE_CHUNK_SIZE: usize = 64 * 1024;
    pub const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
}

/// IPC message defaults.
pub struct IpcConfig;

impl IpcConfig {
    pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024; // 128MB
    pub const PENDING_REPLY_TTL_MS: u64 = 60_000;
    pub const SOCKET_PREFIX: &'static str = "tether-ipc";
    pub const SECRET_ENV: &'static str = "TETHER_SECRET";
    pub const LINK_BUFFER_SIZE: usize = 64 * 1024;
}

/// Cluster discovery and replay protection defaults.
pub struct ClusterConfig;

impl ClusterConfig {
    pub const DISCOVERY_INTERVAL_MS: u64 = 2_000;
    pub const REPLAY_WINDOW_MS: u64 = 30_000;
    pub const REPLAY_CAPACITY: usize = 65_536;
    pub const PEER_CAPACITY: usize = 1_024;
}

/// Runtime configuration for one reactor instance.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TetherConfig {
    /// Worker process count. `0` runs a single process; a negative value
    /// means "CPU cores divided by the absolute value".
    pub workers: i16,
    /// Threads in the opt-in async queue (`0` disables it).
    pub async_threads: usize,
    /// Outbound backlog at which reading is throttled.
    pub throttle_limit: usize,
    pub shutdown_timeout_ms: u64,
    pub max_poll_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_message_size: usize,
    /// Local transport for master/worker links (`unix://` or `tcp://`).
    pub ipc_url: Option<String>,
    /// Cluster TCP/UDP port. `None` disables the cluster.
    pub cluster_port: Option<u16>,
    pub discovery_interval_ms: u64,
    pub replay_window_ms: u64,
    pub replay_capacity: usize,
    pub peer_capacity: usize,
    pub pending_reply_ttl_ms: u64,
    /// Signal number that makes the master recycle its workers.
    pub hot_restart_signal: i32,
    /// Shared cluster secret phrase. Falls back to `TETHER_SECRET`, then to
    /// a random secret (valid only inside this process tree).
    pub secret: Option<String>,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            async_threads: 0,
            throttle_limit: IoConfig::THROTTLE_LIMIT,
            shutdown_timeout_ms: IoConfig::SHUTDOWN_TIMEOUT_MS,
            max_poll_ms: IoConfig::MAX_POLL_MS,
            connect_timeout_ms: IoConfig::CONNECT_TIMEOUT_MS,
            max_message_size: IpcConfig::MAX_MESSAGE_SIZE,
            ipc_url: None,
            cluster_port: None,
            discovery_interval_ms: ClusterConfig::DISCOVERY_INTERVAL_MS,
            replay_window_ms: ClusterConfig::REPLAY_WINDOW_MS,
            replay_capacity: ClusterConfig::REPLAY_CAPACITY,
            peer_capacity: ClusterConfig::PEER_CAPACITY,
            pending_reply_ttl_ms: IpcConfig::PENDING_REPLY_TTL_MS,
            hot_restart_signal: libc::SIGUSR1,
            secret: None,
        }
    }
}

impl TetherConfig {
    /// Load configuration from a JSON file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TetherError::ConfigNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| TetherError::io_with_context(e, format!("reading {}", path.display())))?;
        let config: TetherConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TETHER_*` environment overrides.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var("TETHER_WORKERS") {
            self.workers = value.trim().parse().map_err(|_| TetherError::Config {
                message: format!("TETHER_WORKERS is not a number: {}", value),
            })?;
        }
        if let Ok(value) = std::env::var("TETHER_IPC_URL") {
            if !value.is_empty() {
                self.ipc_url = Some(value);
            }
        }
        if let Ok(value) = std::env::var("TETHER_CLUSTER_PORT") {
            self.cluster_port = Some(value.trim().parse().map_err(|_| TetherError::Config {
                message: format!("TETHER_CLUSTER_PORT is not a port: {}", value),
            })?);
        }
        if self.secret.is_none() {
            if let Ok(value) = std::env::var(IpcConfig::SECRET_ENV) {
                if !value.is_empty() {
                    self.secret = Some(value);
                }
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject values the reactor cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.throttle_limit == 0 {
            return Err(TetherError::Config {
                message: "throttle_limit must be greater than zero".to_string(),
            });
        }
        if self.max_message_size == 0 || self.max_message_size > u32::MAX as usize {
            return Err(TetherError::Config {
                message: format!(
                    "max_message_size must be between 1 and {} bytes",
                    u32::MAX
                ),
            });
        }
        if self.max_poll_ms == 0 {
            return Err(TetherError::Config {
                message: "max_poll_ms must be greater than zero".to_string(),
            });
        }
        if self.replay_capacity < 2 || self.peer_capacity < 2 {
            return Err(TetherError::Config {
                message: "filter capacities must be at least 2".to_string(),
            });
        }
        if self.cluster_port == Some(0) {
            return Err(TetherError::Config {
                message: "cluster_port must not be 0".to_string(),
            });
        }
        Ok(())
    }

    /// Number of worker processes to spawn, resolving negative values
    /// against the available CPU count.
    pub fn worker_count(&self) -> usize {
        match self.workers {
            0 => 0,
            n if n > 0 => n as usize,
            n => {
                let cores = std::thread::available_parallelism()
                    .map(|c| c.get())
                    .unwrap_or(1);
                (cores / n.unsigned_abs() as usize).max(1)
            }
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_reasonable() {
        let config = TetherConfig::default();
        assert_eq!(config.max_message_size, 128 * 1024 * 1024);
        assert_eq!(config.replay_window_ms, 30_000);
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_count(), 0);
    }

    #[test]
    fn test_negative_workers_use_cores() {
        let config = TetherConfig {
            workers: -1,
            ..Default::default()
        };
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"workers": 3, "cluster_port": 9400}}"#).unwrap();

        let config = TetherConfig::load(file.path()).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.cluster_port, Some(9400));
        assert_eq!(config.throttle_limit, IoConfig::THROTTLE_LIMIT);
    }

    #[test]
    fn test_load_missing_file() {
        let result = TetherConfig::load("/nonexistent/tether.json");
        assert!(matches!(result, Err(TetherError::ConfigNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = TetherConfig {
            cluster_port: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
