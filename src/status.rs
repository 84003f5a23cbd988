//! Status lines and user notifications
//!
//! Background work reports through a [`StatusSink`]. The headless build logs
//! through `tracing`; an embedding UI can provide its own sink.

use tracing::info;

/// How soon a status line should be shown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Show now; the caller is on the interactive path
    Immediate,
    /// Posted from background work; show when convenient
    Deferred,
}

pub trait StatusSink: Send + Sync {
    /// Replace the current status line
    fn status(&self, message: &str, mode: DeliveryMode);

    /// One-shot notification, e.g. a finished transfer
    fn notify(&self, summary: &str);
}

/// Sink that writes everything to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn status(&self, message: &str, mode: DeliveryMode) {
        match mode {
            DeliveryMode::Immediate => info!(target: "oxidesftp::status", "{}", message),
            DeliveryMode::Deferred => info!(target: "oxidesftp::status", deferred = true, "{}", message),
        }
    }

    fn notify(&self, summary: &str) {
        info!(target: "oxidesftp::notify", "{}", summary);
    }
}
