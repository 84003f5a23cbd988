//! Edit-in-place mirrors of remote files
//!
//! A mirror is a local copy of a remote file under the temp root, opened in an
//! external editor. Each heartbeat tick compares the local mtime against the
//! last saved one and uploads the file again when it changed.
//!
//! Local layout: `<temp_root>/<user>@<host>/<remote dir segments>/<file name>`

pub mod editor;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::process::Child;
use tracing::{debug, info, warn};

use crate::sftp::path_utils::{remote_file_name, safe_segments};
use crate::sftp::{SftpError, TransferControl, TransferEngine};
use crate::ssh::{Session, SessionReleaseHook};
use crate::status::{DeliveryMode, StatusSink};

pub use editor::{default_editor_command, CommandEditorLauncher, EditorLauncher, NoEditor};

/// One mirrored remote file
struct MirrorEntry {
    id: String,
    session: Session,
    local_dir: PathBuf,
    local_path: PathBuf,
    remote_path: String,
    /// mtime of the local copy as of the last download or upload
    last_saved: SystemTime,
    editor: Option<Child>,
}

impl MirrorEntry {
    fn to_info(&mut self) -> MirrorInfo {
        let editor_running = match self.editor.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(_))) | Some(Err(_)) => {
                self.editor = None;
                false
            }
            None => false,
        };
        MirrorInfo {
            id: self.id.clone(),
            session_id: self.session.id().to_string(),
            local_path: self.local_path.clone(),
            remote_path: self.remote_path.clone(),
            last_saved: DateTime::<Utc>::from(self.last_saved),
            editor_running,
        }
    }
}

/// Snapshot of a mirror
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorInfo {
    pub id: String,
    pub session_id: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub last_saved: DateTime<Utc>,
    pub editor_running: bool,
}

/// What a poll tick needs from an entry, taken without holding the lock
struct PollItem {
    id: String,
    session: Session,
    local_path: PathBuf,
    remote_path: String,
    last_saved: SystemTime,
}

pub struct MirrorWatcher {
    entries: Mutex<Vec<MirrorEntry>>,
    engine: TransferEngine,
    temp_root: PathBuf,
    launcher: Arc<dyn EditorLauncher>,
    status: Arc<dyn StatusSink>,
    uploads: AtomicU64,
    /// Serializes poll ticks
    tick: tokio::sync::Mutex<()>,
}

impl MirrorWatcher {
    pub fn new(
        engine: TransferEngine,
        temp_root: PathBuf,
        launcher: Arc<dyn EditorLauncher>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            engine,
            temp_root,
            launcher,
            status,
            uploads: AtomicU64::new(0),
            tick: tokio::sync::Mutex::new(()),
        }
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// Local path a remote file is mirrored to
    pub fn mirror_path(&self, session: &Session, remote_path: &str) -> PathBuf {
        let mut path = self
            .temp_root
            .join(format!("{}@{}", session.username(), session.host()));
        for segment in safe_segments(remote_path) {
            path.push(segment);
        }
        path
    }

    /// Download a remote file into the temp tree, open it in the editor and
    /// start watching it.
    pub async fn create_mirror(
        &self,
        session: &Session,
        remote_filename: &str,
    ) -> Result<MirrorInfo, SftpError> {
        let remote_path = session.resolve(remote_filename);
        if remote_file_name(&remote_path).is_none() {
            return Err(SftpError::InvalidPath(remote_filename.to_string()));
        }

        let local_path = self.mirror_path(session, &remote_path);
        let local_dir = local_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.temp_root.clone());
        tokio::fs::create_dir_all(&local_dir)
            .await
            .map_err(|e| SftpError::DirectoryCreateFailed {
                path: local_dir.display().to_string(),
                message: e.to_string(),
            })?;

        let control = TransferControl::new();
        self.engine
            .download_file(session, &remote_path, &local_path, &control)
            .await?;
        let last_saved = tokio::fs::metadata(&local_path).await?.modified()?;
        info!("Mirrored {} to {:?}", remote_path, local_path);

        let editor = match self.launcher.launch(&local_path) {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to launch editor for {:?}: {}", local_path, e);
                self.status.status(
                    &format!("Could not open editor for {}: {}", remote_path, e),
                    DeliveryMode::Immediate,
                );
                None
            }
        };

        let mut entries = self.entries.lock();
        if let Some(existing) = entries.iter_mut().find(|e| e.local_path == local_path) {
            debug!("Refreshing existing mirror {}", existing.id);
            existing.session = session.clone();
            existing.last_saved = last_saved;
            if editor.is_some() {
                existing.editor = editor;
            }
            return Ok(existing.to_info());
        }

        let mut entry = MirrorEntry {
            id: uuid::Uuid::new_v4().to_string(),
            session: session.clone(),
            local_dir,
            local_path,
            remote_path,
            last_saved,
            editor,
        };
        let info = entry.to_info();
        entries.push(entry);
        Ok(info)
    }

    /// Upload every mirror whose local copy changed since it was last saved.
    /// Returns the number of successful uploads.
    pub async fn poll_tick(&self) -> usize {
        let _tick = self.tick.lock().await;

        let items: Vec<PollItem> = self
            .entries
            .lock()
            .iter()
            .map(|e| PollItem {
                id: e.id.clone(),
                session: e.session.clone(),
                local_path: e.local_path.clone(),
                remote_path: e.remote_path.clone(),
                last_saved: e.last_saved,
            })
            .collect();

        let mut uploaded = 0;
        for item in items {
            let modified = match tokio::fs::metadata(&item.local_path)
                .await
                .and_then(|m| m.modified())
            {
                Ok(modified) => modified,
                Err(e) => {
                    debug!("Cannot stat mirror {:?}: {}", item.local_path, e);
                    continue;
                }
            };
            if modified <= item.last_saved {
                continue;
            }

            info!("Mirror {:?} changed, uploading to {}", item.local_path, item.remote_path);
            let control = TransferControl::new();
            match self
                .engine
                .upload_file(&item.session, &item.local_path, &item.remote_path, &control)
                .await
            {
                Ok(_) => {
                    if let Some(entry) = self.entries.lock().iter_mut().find(|e| e.id == item.id) {
                        entry.last_saved = modified;
                    }
                    self.uploads.fetch_add(1, Ordering::SeqCst);
                    uploaded += 1;
                    self.status
                        .status(&format!("Saved {}", item.remote_path), DeliveryMode::Deferred);
                }
                Err(e) => {
                    warn!("Mirror upload to {} failed: {}", item.remote_path, e);
                    self.status.status(
                        &format!("Failed to save {}: {}", item.remote_path, e),
                        DeliveryMode::Deferred,
                    );
                }
            }
        }
        uploaded
    }

    /// Successful re-uploads since creation
    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn mirrors(&self) -> Vec<MirrorInfo> {
        self.entries.lock().iter_mut().map(MirrorEntry::to_info).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop watching one mirror and delete its local copy
    pub async fn close(&self, id: &str) -> bool {
        let removed = self.take(|e| e.id == id);
        let found = !removed.is_empty();
        self.remove_files(removed).await;
        found
    }

    /// Drop every mirror owned by `session_id`
    pub async fn clear_session(&self, session_id: &str) -> usize {
        let removed = self.take(|e| e.session.id() == session_id);
        let count = removed.len();
        self.remove_files(removed).await;
        if count > 0 {
            info!("Cleared {} mirror(s) of session {}", count, session_id);
        }
        count
    }

    pub async fn clear_all(&self) -> usize {
        let removed = self.take(|_| true);
        let count = removed.len();
        self.remove_files(removed).await;
        count
    }

    fn take(&self, pred: impl Fn(&MirrorEntry) -> bool) -> Vec<MirrorEntry> {
        let mut entries = self.entries.lock();
        let mut removed = Vec::new();
        let mut i = 0;
        while i < entries.len() {
            if pred(&entries[i]) {
                removed.push(entries.remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    async fn remove_files(&self, removed: Vec<MirrorEntry>) {
        for entry in removed {
            if let Err(e) = tokio::fs::remove_file(&entry.local_path).await {
                debug!("Could not delete mirror {:?}: {}", entry.local_path, e);
            }
            self.prune_dirs(&entry.local_dir).await;
        }
    }

    /// Remove empty directories from `dir` up to, not including, the temp root
    async fn prune_dirs(&self, dir: &Path) {
        let mut current = Some(dir);
        while let Some(dir) = current {
            if dir == self.temp_root || !dir.starts_with(&self.temp_root) {
                break;
            }
            // Fails on non-empty directories, which ends the walk
            if tokio::fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

#[async_trait]
impl SessionReleaseHook for MirrorWatcher {
    async fn on_session_released(&self, session_id: &str) {
        self.clear_session(session_id).await;
    }
}
