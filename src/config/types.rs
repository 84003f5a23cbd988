//! Configuration types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mirror::default_editor_command;
use crate::sftp::types::constants;
use crate::ssh::PoolSettings;

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Top-level client configuration (`~/.oxidesftp/config.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub transfer: TransferConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub mirror: MirrorConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            transfer: TransferConfig::default(),
            connection: ConnectionConfig::default(),
            mirror: MirrorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes moved per read/write
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Finished jobs kept in the queue (0 = unlimited)
    #[serde(default = "default_max_finished_jobs")]
    pub max_finished_jobs: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_finished_jobs: default_max_finished_jobs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connect, authenticate and channel-open deadline
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Seconds between keepalive sweeps (0 = disabled)
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
        }
    }
}

impl ConnectionConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        let timeout = Duration::from_secs(self.connect_timeout_secs.max(1));
        PoolSettings {
            connect_timeout: timeout,
            operation_timeout: timeout,
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Root of the local mirror tree
    #[serde(default = "default_temp_root")]
    pub temp_root: PathBuf,

    /// Editor command; the file path is appended
    #[serde(default = "default_editor")]
    pub editor_command: String,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            temp_root: default_temp_root(),
            editor_command: default_editor(),
        }
    }
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_chunk_size() -> usize {
    constants::DEFAULT_CHUNK_SIZE
}

fn default_max_finished_jobs() -> usize {
    constants::DEFAULT_MAX_FINISHED_JOBS
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_keepalive_interval_secs() -> u64 {
    60
}

fn default_temp_root() -> PathBuf {
    std::env::temp_dir().join("oxidesftp")
}

fn default_editor() -> String {
    default_editor_command().to_string()
}
