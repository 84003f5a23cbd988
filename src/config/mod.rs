//! Configuration Management Module
//!
//! Persistent client settings: transfer chunking, connection timeouts,
//! keepalive cadence and the mirror temp tree.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, ConfigStorage, StorageError};
pub use types::{ClientConfig, ConnectionConfig, MirrorConfig, TransferConfig, CONFIG_VERSION};
