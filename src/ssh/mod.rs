//! SSH module - connections, authentication and the session pool
//!
//! # Features
//! - Direct SSH connections over russh
//! - Public key, password and keyboard-interactive authentication
//! - One pooled, reference-counted session per (host, user)
//! - Liveness probes and in-place rebuild of dead sessions

pub mod auth;
mod client;
mod config;
mod deadline;
mod error;
pub mod pool;
pub mod transport;

pub use client::{ClientHandler, RusshConnector, RusshTransport};
pub use config::{AuthMode, ConnectTarget};
pub use deadline::with_deadline;
pub use error::SshError;
pub use pool::{
    ConnectionPool, PoolSettings, PoolStats, RemoteDirectory, Session, SessionHandle, SessionInfo,
    SessionReleaseHook,
};
pub use transport::{Connector, Transport};
