//! SFTP Session over russh
//!
//! Provides SFTP file operations over an existing SSH connection.

use std::path::Path;

use async_trait::async_trait;
use russh::client::Msg;
use russh::Channel;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::fs::{File, Metadata};
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::error::SftpError;
use super::path_utils::join_remote_path;
use super::remote::{RemoteFile, RemoteFs};
use super::types::{FileInfo, FileType};
use crate::ssh::SshError;

/// SFTP Session wrapper
pub struct SftpSession {
    sftp: RusshSftpSession,
}

impl SftpSession {
    /// Request the SFTP subsystem on `channel` and start a session on it
    pub async fn open(channel: Channel<Msg>) -> Result<Self, SshError> {
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to request SFTP subsystem: {}", e)))?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;

        info!("SFTP subsystem opened");
        Ok(Self { sftp })
    }

    fn map_sftp_error(&self, err: SftpErrorInner, path: &str) -> SftpError {
        let err_str = err.to_string();
        if err_str.contains("No such file") || err_str.contains("not found") {
            SftpError::FileNotFound(path.to_string())
        } else {
            SftpError::ProtocolError(err_str)
        }
    }
}

fn file_info(name: String, path: String, metadata: &Metadata) -> FileInfo {
    let file_type = if metadata.is_dir() {
        FileType::Directory
    } else if metadata.is_symlink() {
        FileType::Symlink
    } else if metadata.is_regular() {
        FileType::File
    } else {
        FileType::Unknown
    };

    FileInfo {
        name,
        path,
        file_type,
        size: metadata.size.unwrap_or(0),
        modified: metadata.mtime.map(|t| t as i64).unwrap_or(0),
        permissions: metadata
            .permissions
            .map(|p| format!("{:o}", p & 0o777))
            .unwrap_or_else(|| "000".to_string()),
        owner: metadata.uid.map(|u: u32| u.to_string()),
        group: metadata.gid.map(|g: u32| g.to_string()),
    }
}

#[async_trait]
impl RemoteFs for SftpSession {
    async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        self.sftp
            .canonicalize(path)
            .await
            .map_err(|e| self.map_sftp_error(e, path))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        debug!("Getting file info: {}", path);
        let metadata = self
            .sftp
            .metadata(path)
            .await
            .map_err(|e| self.map_sftp_error(e, path))?;

        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(file_info(name, path.to_string(), &metadata))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError> {
        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| self.map_sftp_error(e, path))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let full_path = join_remote_path(path, &name);
            entries.push(file_info(name, full_path, &entry.metadata()));
        }
        Ok(entries)
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| SftpError::DirectoryCreateFailed {
                path: path.to_string(),
                message: e.to_string(),
            })
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn RemoteFile>, SftpError> {
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| self.map_sftp_error(e, path))?;
        Ok(Box::new(SftpFile { file }))
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn RemoteFile>, SftpError> {
        let file = self
            .sftp
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| self.map_sftp_error(e, path))?;
        Ok(Box::new(SftpFile { file }))
    }

    async fn close(&self) -> Result<(), SftpError> {
        self.sftp.close().await.map_err(SftpError::from)
    }
}

struct SftpFile {
    file: File,
}

#[async_trait]
impl RemoteFile for SftpFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SftpError> {
        Ok(self.file.read(buf).await?)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, SftpError> {
        Ok(self.file.write(buf).await?)
    }

    // shutdown flushes pending writes and closes the remote handle
    async fn close(&mut self) -> Result<(), SftpError> {
        Ok(self.file.shutdown().await?)
    }
}
