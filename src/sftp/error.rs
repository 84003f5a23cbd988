//! SFTP Error types
//!
//! Every variant maps to a stable negative result code recorded on finished
//! transfer jobs; success is 0.

use thiserror::Error;

use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum SftpError {
    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Cannot open local file {path}: {source}")]
    LocalOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot open remote file {path}: {message}")]
    RemoteOpen { path: String, message: String },

    #[error("Short write on {path}: wrote {written} of {expected} bytes")]
    WriteMismatch {
        path: String,
        expected: usize,
        written: usize,
    },

    #[error("Read failed on {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SFTP protocol error: {0}")]
    ProtocolError(String),

    #[error("Cannot create directory {path}: {message}")]
    DirectoryCreateFailed { path: String, message: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transfer cancelled")]
    TransferCancelled,

    #[error("SSH error: {0}")]
    Ssh(SshError),
}

impl SftpError {
    /// Result code recorded on a finished job
    pub fn code(&self) -> i32 {
        match self {
            SftpError::NotConnected(_) => -1,
            SftpError::LocalOpen { .. } => -2,
            SftpError::RemoteOpen { .. } => -3,
            SftpError::WriteMismatch { .. } => -4,
            SftpError::ReadError { .. } => -5,
            SftpError::IoError(_) => -6,
            SftpError::ProtocolError(_) => -7,
            SftpError::DirectoryCreateFailed { .. } => -8,
            SftpError::FileNotFound(_) => -9,
            SftpError::InvalidPath(_) => -10,
            SftpError::ChannelError(_) => -11,
            SftpError::Timeout(_) => -12,
            SftpError::TransferCancelled => -13,
            SftpError::Ssh(_) => -14,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SftpError::TransferCancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SftpError::Timeout(_))
    }
}

impl From<SshError> for SftpError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::Timeout(msg) => SftpError::Timeout(msg),
            SshError::NotConnected(msg) => SftpError::NotConnected(msg),
            SshError::ChannelError(msg) => SftpError::ChannelError(msg),
            other => SftpError::Ssh(other),
        }
    }
}

impl From<russh_sftp::client::error::Error> for SftpError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        SftpError::ProtocolError(err.to_string())
    }
}

impl serde::Serialize for SftpError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
