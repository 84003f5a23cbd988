//! SFTP data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File entry information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// File name (not full path)
    pub name: String,
    /// Full path
    pub path: String,
    pub file_type: FileType,
    /// File size in bytes
    pub size: u64,
    /// Last modified time (Unix timestamp)
    pub modified: i64,
    /// File permissions (octal string, e.g., "755")
    pub permissions: String,
    /// Owner uid (if available)
    pub owner: Option<String>,
    /// Group gid (if available)
    pub group: Option<String>,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

/// File type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn verb(self) -> &'static str {
        match self {
            TransferDirection::Upload => "Upload",
            TransferDirection::Download => "Download",
        }
    }
}

/// Transfer job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    /// Waiting in queue
    Ready,
    /// Currently transferring
    InProgress,
    /// Reserved; the worker never pauses a job
    Paused,
    Completed,
    CancelledByUser,
    /// Stopped by an error; the job carries the code and message
    CancelledForErrors,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed
                | TransferState::CancelledByUser
                | TransferState::CancelledForErrors
        )
    }
}

/// Read-only view of a transfer job
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferJobInfo {
    pub id: u64,
    pub direction: TransferDirection,
    pub source: String,
    pub destination: String,
    pub display_name: String,
    pub session_id: String,
    pub state: TransferState,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    /// 0 on success, negative error code otherwise
    pub result_code: i32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferJobInfo {
    /// Calculate progress percentage (0-100)
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.state == TransferState::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            (self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Jobs not yet finished, by direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    pub uploads: usize,
    pub downloads: usize,
}

/// Constants for SFTP operations
pub mod constants {
    /// Default chunk size for file transfers (32 KB)
    pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

    /// Upper bound on a single chunk read or write (5 minutes)
    pub const IO_TIMEOUT_SECS: u64 = 300;

    /// Finished jobs kept for inspection
    pub const DEFAULT_MAX_FINISHED_JOBS: usize = 256;
}
