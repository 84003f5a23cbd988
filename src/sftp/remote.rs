//! Remote filesystem seam and the session-level I/O surface
//!
//! `RemoteFs` is what a transport hands back after starting the SFTP
//! subsystem. `Session` wraps it so that every call runs under the global
//! transport lock, and opens are bounded by the operation timeout.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::error::SftpError;
use super::path_utils::resolve_remote_path;
use super::types::{constants, FileInfo};
use crate::ssh::{with_deadline, Session};

/// SFTP operations on one connection
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn canonicalize(&self, path: &str) -> Result<String, SftpError>;

    /// Metadata, following symlinks
    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError>;

    /// Entries of a directory, without `.` and `..`
    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError>;

    async fn create_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn open_read(&self, path: &str) -> Result<Box<dyn RemoteFile>, SftpError>;

    /// Create or truncate for writing
    async fn open_write(&self, path: &str) -> Result<Box<dyn RemoteFile>, SftpError>;

    /// Close the subsystem
    async fn close(&self) -> Result<(), SftpError>;
}

/// An open remote file handle
#[async_trait]
pub trait RemoteFile: Send {
    /// Read up to `buf.len()` bytes; 0 at end of file.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SftpError>;

    /// Returns the number of bytes the server accepted.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, SftpError>;

    async fn close(&mut self) -> Result<(), SftpError>;
}

/// A remote file whose every chunk runs under the transport lock
pub struct LockedRemoteFile {
    inner: Box<dyn RemoteFile>,
    session: Session,
    path: String,
    closed: bool,
}

impl LockedRemoteFile {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SftpError> {
        let _state = self.session.lock_transport().await;
        let result = tokio::time::timeout(io_timeout(), self.inner.read(buf)).await;
        match result {
            Ok(r) => r.map_err(|e| SftpError::ReadError {
                path: self.path.clone(),
                message: e.to_string(),
            }),
            Err(_) => {
                self.session.invalidate();
                Err(SftpError::Timeout(format!("read of {} timed out", self.path)))
            }
        }
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, SftpError> {
        let _state = self.session.lock_transport().await;
        match tokio::time::timeout(io_timeout(), self.inner.write(buf)).await {
            Ok(r) => r,
            Err(_) => {
                self.session.invalidate();
                Err(SftpError::Timeout(format!("write to {} timed out", self.path)))
            }
        }
    }

    pub async fn close(mut self) -> Result<(), SftpError> {
        self.closed = true;
        let _state = self.session.lock_transport().await;
        self.inner.close().await
    }
}

impl Drop for LockedRemoteFile {
    fn drop(&mut self) {
        if !self.closed {
            warn!("Remote file {} dropped without close", self.path);
        }
    }
}

fn io_timeout() -> Duration {
    Duration::from_secs(constants::IO_TIMEOUT_SECS)
}

impl Session {
    /// Resolve a possibly relative remote path against the current directory
    pub fn resolve(&self, path: &str) -> String {
        resolve_remote_path(&self.cwd(), path)
    }

    /// Fail fast when the session has left the pool
    pub async fn ensure_connected(&self) -> Result<(), SftpError> {
        let (_state, _sftp) = self.lock_sftp().await?;
        Ok(())
    }

    /// Run a bounded open-style call. A timeout invalidates the session.
    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T, SftpError>
    where
        F: std::future::Future<Output = Result<T, SftpError>>,
    {
        let result = with_deadline(self.operation_timeout(), what, fut).await;
        if let Err(e) = &result {
            if e.is_timeout() {
                self.invalidate();
            }
        }
        result
    }

    pub async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        let path = self.resolve(path);
        let (_state, sftp) = self.lock_sftp().await?;
        self.bounded("stat", sftp.stat(&path)).await
    }

    /// List a directory, sorted by name
    pub async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError> {
        let path = self.resolve(path);
        let (_state, sftp) = self.lock_sftp().await?;
        let mut entries = self.bounded("read_dir", sftp.read_dir(&path)).await?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        debug!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    pub async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        let path = self.resolve(path);
        let (_state, sftp) = self.lock_sftp().await?;
        self.bounded("mkdir", sftp.create_dir(&path)).await
    }

    pub async fn open_read(&self, path: &str) -> Result<LockedRemoteFile, SftpError> {
        let path = self.resolve(path);
        let (_state, sftp) = self.lock_sftp().await?;
        let inner = self
            .bounded("remote open", sftp.open_read(&path))
            .await
            .map_err(|e| remote_open_error(&path, e))?;
        Ok(self.wrap(inner, path))
    }

    pub async fn open_write(&self, path: &str) -> Result<LockedRemoteFile, SftpError> {
        let path = self.resolve(path);
        let (_state, sftp) = self.lock_sftp().await?;
        let inner = self
            .bounded("remote open", sftp.open_write(&path))
            .await
            .map_err(|e| remote_open_error(&path, e))?;
        Ok(self.wrap(inner, path))
    }

    fn wrap(&self, inner: Box<dyn RemoteFile>, path: String) -> LockedRemoteFile {
        LockedRemoteFile {
            inner,
            session: self.clone(),
            path,
            closed: false,
        }
    }

    /// Change the current directory and refresh the cached listing.
    /// On failure the previous directory stays current.
    pub async fn change_dir(&self, path: &str) -> Result<String, SftpError> {
        let target = self.resolve(path);
        let (state, sftp) = self.lock_sftp().await?;
        let canonical = self.bounded("canonicalize", sftp.canonicalize(&target)).await?;
        let info = self.bounded("stat", sftp.stat(&canonical)).await?;
        if !info.is_dir() {
            return Err(SftpError::InvalidPath(format!("{} is not a directory", canonical)));
        }
        let mut entries = self.bounded("read_dir", sftp.read_dir(&canonical)).await?;
        drop(state);

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        self.set_remote_dir(canonical.clone(), entries);
        Ok(canonical)
    }

    /// Re-list the current directory into the cache
    pub async fn refresh_listing(&self) -> Result<Vec<FileInfo>, SftpError> {
        let cwd = self.cwd();
        let entries = self.read_dir(&cwd).await?;
        self.set_remote_dir(cwd, entries.clone());
        Ok(entries)
    }
}

// Keep the remote open classification for errors that are not about the
// session itself.
fn remote_open_error(path: &str, err: SftpError) -> SftpError {
    match err {
        SftpError::Timeout(_)
        | SftpError::NotConnected(_)
        | SftpError::ChannelError(_)
        | SftpError::Ssh(_)
        | SftpError::RemoteOpen { .. } => err,
        other => SftpError::RemoteOpen {
            path: path.to_string(),
            message: other.to_string(),
        },
    }
}
