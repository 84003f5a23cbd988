//! Bounded waits for blocking session calls
//!
//! Every connect, channel open and remote file open runs under a deadline.
//! The future is dropped when the deadline passes, which aborts the pending
//! request; the caller then decides what to invalidate.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::error::SshError;

/// Run `fut` with a deadline. `what` names the operation in the timeout error.
pub async fn with_deadline<T, E, F>(timeout: Duration, what: &str, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<SshError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!("{} timed out after {:?}", what, timeout);
            Err(SshError::Timeout(format!("{} timed out after {}s", what, timeout.as_secs())).into())
        }
    }
}
