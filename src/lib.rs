//! OxideSftp - pooled SSH/SFTP sessions for a file manager backend
//!
//! Built with Rust, tokio and russh. One session per (host, user), a serial
//! transfer queue, and edit-in-place mirrors kept in sync by a 1 Hz heartbeat.

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (chunk buffers, listings, etc.)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod context;
pub mod heartbeat;
pub mod mirror;
pub mod sftp;
pub mod ssh;
pub mod status;

#[cfg(test)]
mod testing;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use context::BackgroundContext;

/// Initialize logging
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
