//! Transport seam between the session pool and the wire
//!
//! The pool only ever talks to these traits. The russh implementation lives in
//! `client.rs`; tests plug in an in-memory transport.

use std::sync::Arc;

use async_trait::async_trait;

use super::config::ConnectTarget;
use super::error::SshError;
use crate::sftp::remote::RemoteFs;

/// Opens authenticated transports
#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolve, handshake and authenticate. The caller bounds this with the
    /// connect timeout.
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Transport>, SshError>;
}

/// One authenticated SSH connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a throwaway session channel and close it again.
    async fn probe(&self) -> Result<(), SshError>;

    /// Start the SFTP subsystem on a fresh channel.
    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>, SshError>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);
}
