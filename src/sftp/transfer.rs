//! Chunked file and directory transfers
//!
//! Every transfer moves data in fixed-size chunks, checks for cancellation
//! between chunks, and closes whatever it opened on every exit path.
//! Directory transfers recurse in name order and stop at the first failure.

use std::future::Future;
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info};

use super::error::SftpError;
use super::path_utils::join_remote_path;
use super::remote::LockedRemoteFile;
use super::types::{constants, FileType};
use crate::ssh::Session;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Transfer control signals and progress counters
#[derive(Debug)]
pub struct TransferControl {
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    transferred: AtomicU64,
    total: AtomicU64,
    current_file: Mutex<Option<String>>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            cancel_tx,
            cancel_rx,
            transferred: AtomicU64::new(0),
            total: AtomicU64::new(0),
            current_file: Mutex::new(None),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn current_file(&self) -> Option<String> {
        self.current_file.lock().clone()
    }

    fn add_transferred(&self, bytes: usize) {
        self.transferred.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn add_total(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
    }

    fn set_current_file(&self, name: &str) {
        *self.current_file.lock() = Some(name.to_string());
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if transfer should continue (not cancelled)
pub fn check_transfer_control(control: &TransferControl) -> Result<(), SftpError> {
    if control.is_cancelled() {
        return Err(SftpError::TransferCancelled);
    }
    Ok(())
}

/// Files and bytes moved by one transfer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferTotals {
    pub files: u64,
    pub bytes: u64,
}

impl TransferTotals {
    fn file(bytes: u64) -> Self {
        Self { files: 1, bytes }
    }
}

impl AddAssign for TransferTotals {
    fn add_assign(&mut self, rhs: Self) {
        self.files += rhs.files;
        self.bytes += rhs.bytes;
    }
}

/// Moves files between the local disk and a pooled session
#[derive(Debug, Clone, Copy)]
pub struct TransferEngine {
    chunk_size: usize,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new(constants::DEFAULT_CHUNK_SIZE)
    }
}

impl TransferEngine {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Upload a local file or directory tree to `remote`.
    pub async fn upload(
        &self,
        session: &Session,
        local: &Path,
        remote: &str,
        control: &TransferControl,
    ) -> Result<TransferTotals, SftpError> {
        let metadata = tokio::fs::metadata(local)
            .await
            .map_err(|e| local_open_error(local, e))?;

        if metadata.is_dir() {
            self.upload_dir(session, local, remote, control).await
        } else {
            let bytes = self.upload_file(session, local, remote, control).await?;
            Ok(TransferTotals::file(bytes))
        }
    }

    /// Download a remote file or directory tree to `local`.
    pub async fn download(
        &self,
        session: &Session,
        remote: &str,
        local: &Path,
        control: &TransferControl,
    ) -> Result<TransferTotals, SftpError> {
        let info = session.stat(remote).await?;
        if info.file_type == FileType::Directory {
            self.download_dir(session, remote, local, control).await
        } else {
            let bytes = self.download_file(session, remote, local, control).await?;
            Ok(TransferTotals::file(bytes))
        }
    }

    /// Upload one file. The remote file is created or truncated.
    pub async fn upload_file(
        &self,
        session: &Session,
        local: &Path,
        remote: &str,
        control: &TransferControl,
    ) -> Result<u64, SftpError> {
        session.ensure_connected().await?;

        let mut local_file = tokio::fs::File::open(local)
            .await
            .map_err(|e| local_open_error(local, e))?;
        let size = local_file.metadata().await?.len();
        control.add_total(size);
        control.set_current_file(remote);

        let mut remote_file = session.open_write(remote).await?;
        debug!("Uploading {:?} -> {} ({} bytes)", local, remote, size);

        let result = self
            .pump_upload(&mut local_file, local, &mut remote_file, control)
            .await;
        let closed = remote_file.close().await;

        let sent = result?;
        closed?;
        Ok(sent)
    }

    async fn pump_upload(
        &self,
        local_file: &mut tokio::fs::File,
        local: &Path,
        remote_file: &mut LockedRemoteFile,
        control: &TransferControl,
    ) -> Result<u64, SftpError> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut sent = 0u64;

        loop {
            check_transfer_control(control)?;

            let n = local_file
                .read(&mut buf)
                .await
                .map_err(|e| SftpError::ReadError {
                    path: local.display().to_string(),
                    message: e.to_string(),
                })?;
            if n == 0 {
                break;
            }

            let mut written = 0;
            while written < n {
                let accepted = remote_file.write(&buf[written..n]).await?;
                if accepted == 0 {
                    return Err(SftpError::WriteMismatch {
                        path: remote_file.path().to_string(),
                        expected: n,
                        written,
                    });
                }
                written += accepted;
            }

            sent += n as u64;
            control.add_transferred(n);
        }

        Ok(sent)
    }

    /// Download one file. The local file is created or truncated.
    pub async fn download_file(
        &self,
        session: &Session,
        remote: &str,
        local: &Path,
        control: &TransferControl,
    ) -> Result<u64, SftpError> {
        session.ensure_connected().await?;

        let mut remote_file = session.open_read(remote).await?;
        let result = self
            .pump_download(session, &mut remote_file, local, control)
            .await;
        let closed = remote_file.close().await;

        let received = result?;
        closed?;
        Ok(received)
    }

    async fn pump_download(
        &self,
        session: &Session,
        remote_file: &mut LockedRemoteFile,
        local: &Path,
        control: &TransferControl,
    ) -> Result<u64, SftpError> {
        let size = session.stat(remote_file.path()).await?.size;
        control.add_total(size);
        control.set_current_file(remote_file.path());

        let mut local_file = tokio::fs::File::create(local)
            .await
            .map_err(|e| local_open_error(local, e))?;
        debug!("Downloading {} -> {:?} ({} bytes)", remote_file.path(), local, size);

        let mut buf = vec![0u8; self.chunk_size];
        let mut received = 0u64;

        loop {
            check_transfer_control(control)?;

            let n = remote_file.read(&mut buf).await?;
            if n == 0 {
                break;
            }

            // tokio::fs::File takes at most 2 MiB per call
            let mut written = 0;
            while written < n {
                let accepted = local_file.write(&buf[written..n]).await?;
                if accepted == 0 {
                    return Err(SftpError::WriteMismatch {
                        path: local.display().to_string(),
                        expected: n,
                        written,
                    });
                }
                written += accepted;
            }

            received += n as u64;
            control.add_transferred(n);
        }

        local_file.flush().await?;
        Ok(received)
    }

    /// Upload a directory tree. An existing remote directory is reused.
    pub fn upload_dir<'a>(
        &'a self,
        session: &'a Session,
        local: &'a Path,
        remote: &'a str,
        control: &'a TransferControl,
    ) -> BoxFuture<'a, Result<TransferTotals, SftpError>> {
        Box::pin(async move {
            session.ensure_connected().await?;
            self.ensure_remote_dir(session, remote).await?;

            let mut entries: Vec<(String, PathBuf, bool)> = Vec::new();
            let mut read_dir = tokio::fs::read_dir(local)
                .await
                .map_err(|e| local_open_error(local, e))?;
            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                let is_dir = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| local_open_error(&path, e))?
                    .is_dir();
                entries.push((entry.file_name().to_string_lossy().to_string(), path, is_dir));
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut totals = TransferTotals::default();
            for (name, path, is_dir) in entries {
                check_transfer_control(control)?;
                let remote_child = join_remote_path(remote, &name);
                if is_dir {
                    totals += self.upload_dir(session, &path, &remote_child, control).await?;
                } else {
                    let bytes = self.upload_file(session, &path, &remote_child, control).await?;
                    totals += TransferTotals::file(bytes);
                }
            }

            info!(
                "Uploaded directory {:?} -> {} ({} files, {} bytes)",
                local, remote, totals.files, totals.bytes
            );
            Ok(totals)
        })
    }

    async fn ensure_remote_dir(&self, session: &Session, remote: &str) -> Result<(), SftpError> {
        match session.create_dir(remote).await {
            Ok(()) => Ok(()),
            Err(create_err) => match session.stat(remote).await {
                Ok(info) if info.file_type == FileType::Directory => {
                    debug!("Remote directory {} already exists", remote);
                    Ok(())
                }
                _ => Err(match create_err {
                    e @ SftpError::DirectoryCreateFailed { .. } => e,
                    e @ (SftpError::NotConnected(_) | SftpError::Timeout(_)) => e,
                    other => SftpError::DirectoryCreateFailed {
                        path: remote.to_string(),
                        message: other.to_string(),
                    },
                }),
            },
        }
    }

    /// Download a directory tree. The local directory is created first.
    pub fn download_dir<'a>(
        &'a self,
        session: &'a Session,
        remote: &'a str,
        local: &'a Path,
        control: &'a TransferControl,
    ) -> BoxFuture<'a, Result<TransferTotals, SftpError>> {
        Box::pin(async move {
            session.ensure_connected().await?;
            tokio::fs::create_dir_all(local)
                .await
                .map_err(|e| SftpError::DirectoryCreateFailed {
                    path: local.display().to_string(),
                    message: e.to_string(),
                })?;

            let entries = session.read_dir(remote).await?;

            let mut totals = TransferTotals::default();
            for entry in entries {
                check_transfer_control(control)?;
                let local_child = local.join(&entry.name);
                let remote_child = join_remote_path(remote, &entry.name);
                if entry.file_type == FileType::Directory {
                    totals += self
                        .download_dir(session, &remote_child, &local_child, control)
                        .await?;
                } else {
                    let bytes = self
                        .download_file(session, &remote_child, &local_child, control)
                        .await?;
                    totals += TransferTotals::file(bytes);
                }
            }

            info!(
                "Downloaded directory {} -> {:?} ({} files, {} bytes)",
                remote, local, totals.files, totals.bytes
            );
            Ok(totals)
        })
    }
}

fn local_open_error(path: &Path, source: std::io::Error) -> SftpError {
    SftpError::LocalOpen {
        path: path.display().to_string(),
        source,
    }
}
