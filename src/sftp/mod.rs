//! SFTP file management module
//!
//! Remote file I/O on pooled sessions, chunked transfers and the serial
//! transfer queue.

pub mod error;
pub mod path_utils;
pub mod queue;
pub mod remote;
pub mod session;
pub mod transfer;
pub mod types;

pub use error::SftpError;
pub use queue::TransferQueue;
pub use remote::{LockedRemoteFile, RemoteFile, RemoteFs};
pub use session::SftpSession;
pub use transfer::{check_transfer_control, TransferControl, TransferEngine, TransferTotals};
pub use types::*;
