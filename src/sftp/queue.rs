//! Serial transfer queue
//!
//! Jobs are appended by producers and executed one at a time by a single
//! background worker. The worker is spawned on demand and exits when no ready
//! job is left; the `worker_running` flag is only read and written under the
//! queue lock, so two workers never coexist.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::error::SftpError;
use super::path_utils::{join_remote_path, remote_file_name, resolve_local_source};
use super::transfer::{TransferControl, TransferEngine, TransferTotals};
use super::types::{PendingCounts, TransferDirection, TransferJobInfo, TransferState};
use crate::ssh::Session;
use crate::status::{DeliveryMode, StatusSink};

/// One queued upload or download
struct TransferJob {
    id: u64,
    direction: TransferDirection,
    /// Local path for uploads, remote path for downloads
    source: String,
    destination: String,
    display_name: String,
    session: Session,
    control: Arc<TransferControl>,
    state: TransferState,
    /// Set by `cancel` while the worker holds the job
    cancel_requested: bool,
    result_code: i32,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TransferJob {
    fn to_info(&self) -> TransferJobInfo {
        TransferJobInfo {
            id: self.id,
            direction: self.direction,
            source: self.source.clone(),
            destination: self.destination.clone(),
            display_name: self.display_name.clone(),
            session_id: self.session.id().to_string(),
            state: self.state,
            total_bytes: self.control.total(),
            transferred_bytes: self.control.transferred(),
            result_code: self.result_code,
            error: self.error.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    fn work(&self) -> WorkItem {
        WorkItem {
            id: self.id,
            direction: self.direction,
            source: self.source.clone(),
            destination: self.destination.clone(),
            display_name: self.display_name.clone(),
            session: self.session.clone(),
            control: Arc::clone(&self.control),
        }
    }
}

/// What the worker needs outside the queue lock
struct WorkItem {
    id: u64,
    direction: TransferDirection,
    source: String,
    destination: String,
    display_name: String,
    session: Session,
    control: Arc<TransferControl>,
}

struct QueueState {
    jobs: Vec<TransferJob>,
    worker_running: bool,
    next_id: u64,
}

/// Serial transfer queue
pub struct TransferQueue {
    state: Mutex<QueueState>,
    engine: TransferEngine,
    status: Arc<dyn StatusSink>,
    /// Finished jobs kept for inspection (0 = keep all)
    max_finished: usize,
    idle: Notify,
    workers_spawned: AtomicU64,
}

impl TransferQueue {
    pub fn new(engine: TransferEngine, status: Arc<dyn StatusSink>, max_finished: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                jobs: Vec::new(),
                worker_running: false,
                next_id: 1,
            }),
            engine,
            status,
            max_finished,
            idle: Notify::new(),
            workers_spawned: AtomicU64::new(0),
        })
    }

    /// Queue one job per entry of `files` and make sure a worker is running.
    ///
    /// Uploads take local paths or `file://` URIs and land in `target_dir`
    /// (default: the session's current directory). Downloads take remote paths
    /// relative to the current directory and land in the local `target_dir`
    /// (default: the process working directory). Must be called from within a
    /// tokio runtime.
    pub fn enqueue(
        self: &Arc<Self>,
        direction: TransferDirection,
        files: &[String],
        session: &Session,
        target_dir: Option<&str>,
    ) -> Result<Vec<u64>, SftpError> {
        let mut prepared = Vec::with_capacity(files.len());
        for file in files {
            prepared.push(prepare(direction, file, session, target_dir)?);
        }

        let ids = {
            let mut state = self.state.lock();
            let mut ids = Vec::with_capacity(prepared.len());
            for (source, destination, display_name) in prepared {
                let id = state.next_id;
                state.next_id += 1;
                debug!("Queued {} job {}: {} -> {}", direction.verb(), id, source, destination);
                state.jobs.push(TransferJob {
                    id,
                    direction,
                    source,
                    destination,
                    display_name,
                    session: session.clone(),
                    control: Arc::new(TransferControl::new()),
                    state: TransferState::Ready,
                    cancel_requested: false,
                    result_code: 0,
                    error: None,
                    started_at: None,
                    finished_at: None,
                });
                ids.push(id);
            }
            ids
        };

        if !ids.is_empty() {
            self.ensure_worker();
        }
        Ok(ids)
    }

    fn ensure_worker(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.worker_running {
                return;
            }
            state.worker_running = true;
        }

        self.workers_spawned.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.run_worker().await;
        });
    }

    async fn run_worker(self: Arc<Self>) {
        info!("Transfer worker started");
        loop {
            let next = {
                let mut state = self.state.lock();
                match state
                    .jobs
                    .iter_mut()
                    .find(|job| job.state == TransferState::Ready)
                {
                    Some(job) => {
                        job.state = TransferState::InProgress;
                        job.started_at = Some(Utc::now());
                        Some(job.work())
                    }
                    None => {
                        state.worker_running = false;
                        None
                    }
                }
            };

            let Some(work) = next else { break };

            self.status.status(
                &format!("{} {}...", progress_verb(work.direction), work.display_name),
                DeliveryMode::Deferred,
            );

            let result = self.execute(&work).await;
            if let Some(summary) = self.finish(work.id, result) {
                self.status.status(&summary, DeliveryMode::Deferred);
                self.status.notify(&summary);
            }
        }
        info!("Transfer worker idle");
        self.idle.notify_waiters();
    }

    async fn execute(&self, work: &WorkItem) -> Result<TransferTotals, SftpError> {
        match work.direction {
            TransferDirection::Upload => {
                self.engine
                    .upload(
                        &work.session,
                        Path::new(&work.source),
                        &work.destination,
                        &work.control,
                    )
                    .await
            }
            TransferDirection::Download => {
                self.engine
                    .download(
                        &work.session,
                        &work.source,
                        Path::new(&work.destination),
                        &work.control,
                    )
                    .await
            }
        }
    }

    /// Record the outcome and return the summary line
    fn finish(&self, id: u64, result: Result<TransferTotals, SftpError>) -> Option<String> {
        let mut state = self.state.lock();
        let job = state.jobs.iter_mut().find(|job| job.id == id)?;

        let now = Utc::now();
        let elapsed = job
            .started_at
            .map(|start| (now - start).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        job.finished_at = Some(now);

        let summary = match result {
            Ok(totals) => {
                job.state = TransferState::Completed;
                job.result_code = 0;
                info!(
                    "Job {} completed: {} files, {} bytes in {:.1}s",
                    id, totals.files, totals.bytes, elapsed
                );
                format!(
                    "{} of {} completed ({} in {:.1}s)",
                    job.direction.verb(),
                    job.display_name,
                    format_size(totals.bytes),
                    elapsed
                )
            }
            Err(e) if e.is_cancelled() || job.cancel_requested => {
                debug!("Job {} cancelled: {}", id, e);
                job.state = TransferState::CancelledByUser;
                job.result_code = SftpError::TransferCancelled.code();
                format!("{} of {} cancelled", job.direction.verb(), job.display_name)
            }
            Err(e) => {
                warn!("Job {} failed: {}", id, e);
                job.state = TransferState::CancelledForErrors;
                job.result_code = e.code();
                job.error = Some(e.to_string());
                format!(
                    "{} of {} failed: {}",
                    job.direction.verb(),
                    job.display_name,
                    e
                )
            }
        };

        prune_finished(&mut state.jobs, self.max_finished);
        Some(summary)
    }

    /// Cancel a ready or running job
    pub fn cancel(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let Some(job) = state.jobs.iter_mut().find(|job| job.id == id) else {
            return false;
        };
        match job.state {
            TransferState::Ready | TransferState::Paused => {
                job.state = TransferState::CancelledByUser;
                job.result_code = SftpError::TransferCancelled.code();
                job.finished_at = Some(Utc::now());
                job.control.cancel();
                true
            }
            TransferState::InProgress if !job.cancel_requested => {
                // Stays in progress until the worker stops at the next chunk
                job.cancel_requested = true;
                job.control.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel everything not yet finished. Returns how many jobs were hit.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<u64> = {
            let state = self.state.lock();
            state
                .jobs
                .iter()
                .filter(|job| !job.state.is_terminal())
                .map(|job| job.id)
                .collect()
        };
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    /// Drop every finished job
    pub fn clear_finished(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state.jobs.retain(|job| !job.state.is_terminal());
        before - state.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<TransferJobInfo> {
        self.state.lock().jobs.get(index).map(TransferJob::to_info)
    }

    pub fn find(&self, id: u64) -> Option<TransferJobInfo> {
        self.state
            .lock()
            .jobs
            .iter()
            .find(|job| job.id == id)
            .map(TransferJob::to_info)
    }

    pub fn jobs(&self) -> Vec<TransferJobInfo> {
        self.state.lock().jobs.iter().map(TransferJob::to_info).collect()
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let state = self.state.lock();
        let mut counts = PendingCounts::default();
        for job in state.jobs.iter().filter(|job| !job.state.is_terminal()) {
            match job.direction {
                TransferDirection::Upload => counts.uploads += 1,
                TransferDirection::Download => counts.downloads += 1,
            }
        }
        counts
    }

    /// Whether a worker is currently running
    pub fn is_transfer_active(&self) -> bool {
        self.state.lock().worker_running
    }

    /// Number of workers spawned over the queue's lifetime
    pub fn workers_spawned(&self) -> u64 {
        self.workers_spawned.load(Ordering::SeqCst)
    }

    /// Wait until the worker has drained the queue
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.is_transfer_active() {
                return;
            }
            notified.await;
        }
    }
}

fn prepare(
    direction: TransferDirection,
    file: &str,
    session: &Session,
    target_dir: Option<&str>,
) -> Result<(String, String, String), SftpError> {
    match direction {
        TransferDirection::Upload => {
            let local = resolve_local_source(file)?;
            let name = local
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| SftpError::InvalidPath(file.to_string()))?;
            let dir = session.resolve(target_dir.unwrap_or("."));
            let destination = join_remote_path(&dir, &name);
            Ok((local.display().to_string(), destination, name))
        }
        TransferDirection::Download => {
            let remote = session.resolve(file);
            let name = remote_file_name(&remote)
                .map(str::to_string)
                .ok_or_else(|| SftpError::InvalidPath(file.to_string()))?;
            let dir = match target_dir {
                Some(dir) => PathBuf::from(dir),
                None => std::env::current_dir()?,
            };
            let destination = dir.join(&name).display().to_string();
            Ok((remote, destination, name))
        }
    }
}

/// Drop the oldest finished jobs beyond `max_finished`
fn prune_finished(jobs: &mut Vec<TransferJob>, max_finished: usize) {
    if max_finished == 0 {
        return;
    }
    let finished = jobs.iter().filter(|job| job.state.is_terminal()).count();
    let mut excess = finished.saturating_sub(max_finished);
    if excess == 0 {
        return;
    }
    jobs.retain(|job| {
        if excess > 0 && job.state.is_terminal() {
            excess -= 1;
            false
        } else {
            true
        }
    });
}

fn progress_verb(direction: TransferDirection) -> &'static str {
    match direction {
        TransferDirection::Upload => "Uploading",
        TransferDirection::Download => "Downloading",
    }
}

fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.1} GB", b / GB)
    } else if b >= MB {
        format!("{:.1} MB", b / MB)
    } else if b >= KB {
        format!("{:.1} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{ConnectTarget, ConnectionPool, PoolSettings, SessionHandle};
    use crate::testing::{MockConnector, MockRemote, RecordingSink};
    use tempfile::tempdir;

    async fn connect(remote: &Arc<MockRemote>) -> SessionHandle {
        let pool = ConnectionPool::new(
            Arc::new(MockConnector::new(Arc::clone(remote))),
            PoolSettings::default(),
        );
        pool.connect(ConnectTarget::new("example.org", "alice").with_credential("pw"))
            .await
            .unwrap()
    }

    fn queue(sink: &Arc<RecordingSink>, max_finished: usize) -> Arc<TransferQueue> {
        TransferQueue::new(TransferEngine::new(4096), sink.clone(), max_finished)
    }

    #[tokio::test]
    async fn test_download_ten_thousand_bytes() {
        let remote = MockRemote::new();
        let content: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
        remote.add_file("/home/test/data.bin", &content);
        let handle = connect(&remote).await;
        let sink = RecordingSink::new();
        let queue = queue(&sink, 16);
        let temp = tempdir().unwrap();
        let target = temp.path().display().to_string();

        let ids = queue
            .enqueue(
                TransferDirection::Download,
                &["data.bin".to_string()],
                &handle,
                Some(&target),
            )
            .unwrap();
        queue.wait_idle().await;

        let job = queue.find(ids[0]).unwrap();
        assert_eq!(job.state, TransferState::Completed);
        assert_eq!(job.result_code, 0);
        assert_eq!(job.transferred_bytes, 10_000);
        assert_eq!(job.total_bytes, 10_000);
        assert!(job.finished_at.is_some());
        assert_eq!(std::fs::read(temp.path().join("data.bin")).unwrap(), content);

        let notes = sink.notifications();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("Download of data.bin completed"));

        handle.release().await;
    }

    #[tokio::test]
    async fn test_directory_upload_stops_at_first_failure() {
        let remote = MockRemote::new();
        remote.fail_write_open("/home/test/dir/b.txt");
        let handle = connect(&remote).await;
        let sink = RecordingSink::new();
        let queue = queue(&sink, 16);

        let temp = tempdir().unwrap();
        let dir = temp.path().join("dir");
        std::fs::create_dir(&dir).unwrap();
        for name in ["c.txt", "a.txt", "b.txt"] {
            std::fs::write(dir.join(name), name.as_bytes()).unwrap();
        }

        let ids = queue
            .enqueue(
                TransferDirection::Upload,
                &[dir.display().to_string()],
                &handle,
                None,
            )
            .unwrap();
        queue.wait_idle().await;

        let job = queue.find(ids[0]).unwrap();
        assert_eq!(job.state, TransferState::CancelledForErrors);
        assert_eq!(job.destination, "/home/test/dir");
        assert!(job.result_code < 0);
        assert!(job.error.as_deref().unwrap().contains("b.txt"));

        assert_eq!(
            remote.write_opens(),
            vec!["/home/test/dir/a.txt", "/home/test/dir/b.txt"]
        );
        assert_eq!(remote.file("/home/test/dir/a.txt").unwrap(), b"a.txt");
        assert!(remote.file("/home/test/dir/c.txt").is_none());

        assert!(sink.notifications()[0].contains("failed"));
        handle.release().await;
    }

    #[tokio::test]
    async fn test_single_worker_runs_jobs_in_order() {
        let remote = MockRemote::new();
        for i in 0..5 {
            remote.add_file(&format!("/home/test/f{}.txt", i), format!("file {}", i).as_bytes());
        }
        let handle = connect(&remote).await;
        let sink = RecordingSink::new();
        let queue = queue(&sink, 16);
        let temp = tempdir().unwrap();
        let target = temp.path().display().to_string();

        let files: Vec<String> = (0..5).map(|i| format!("f{}.txt", i)).collect();
        queue
            .enqueue(TransferDirection::Download, &files[..3], &handle, Some(&target))
            .unwrap();
        queue
            .enqueue(TransferDirection::Download, &files[3..], &handle, Some(&target))
            .unwrap();
        assert!(queue.is_transfer_active());
        assert_eq!(queue.pending_counts(), PendingCounts { uploads: 0, downloads: 5 });

        queue.wait_idle().await;

        assert_eq!(queue.workers_spawned(), 1);
        assert_eq!(remote.max_open_files(), 1);
        assert!(queue
            .jobs()
            .iter()
            .all(|job| job.state == TransferState::Completed));
        let opened: Vec<String> = (0..5).map(|i| format!("/home/test/f{}.txt", i)).collect();
        assert_eq!(remote.read_opens(), opened);
        assert_eq!(queue.pending_counts(), PendingCounts::default());

        handle.release().await;
    }

    #[tokio::test]
    async fn test_worker_restarts_after_idle() {
        let remote = MockRemote::new();
        remote.add_file("/home/test/a.txt", b"a");
        let handle = connect(&remote).await;
        let sink = RecordingSink::new();
        let queue = queue(&sink, 16);
        let temp = tempdir().unwrap();
        let target = temp.path().display().to_string();

        queue
            .enqueue(TransferDirection::Download, &["a.txt".into()], &handle, Some(&target))
            .unwrap();
        queue.wait_idle().await;
        assert!(!queue.is_transfer_active());

        queue
            .enqueue(TransferDirection::Download, &["a.txt".into()], &handle, Some(&target))
            .unwrap();
        queue.wait_idle().await;

        assert_eq!(queue.workers_spawned(), 2);
        assert_eq!(queue.len(), 2);

        handle.release().await;
    }

    #[tokio::test]
    async fn test_cancel_ready_job() {
        let remote = MockRemote::new();
        remote.add_file("/home/test/a.txt", b"a");
        remote.add_file("/home/test/b.txt", b"b");
        let handle = connect(&remote).await;
        let sink = RecordingSink::new();
        let queue = queue(&sink, 16);
        let temp = tempdir().unwrap();
        let target = temp.path().display().to_string();

        // current-thread runtime: the worker cannot start before we await
        let ids = queue
            .enqueue(
                TransferDirection::Download,
                &["a.txt".into(), "b.txt".into()],
                &handle,
                Some(&target),
            )
            .unwrap();
        assert!(queue.cancel(ids[1]));
        queue.wait_idle().await;

        assert_eq!(queue.find(ids[0]).unwrap().state, TransferState::Completed);
        let cancelled = queue.find(ids[1]).unwrap();
        assert_eq!(cancelled.state, TransferState::CancelledByUser);
        assert_eq!(cancelled.result_code, SftpError::TransferCancelled.code());
        assert_eq!(remote.read_opens(), vec!["/home/test/a.txt"]);
        assert!(!queue.cancel(ids[1]));

        handle.release().await;
    }

    #[tokio::test]
    async fn test_cancel_running_job_keeps_it_until_worker_stops() {
        let remote = MockRemote::new();
        remote.add_file("/home/test/big.bin", &vec![3u8; 256 * 1024]);
        let handle = connect(&remote).await;
        let sink = RecordingSink::new();
        let queue = TransferQueue::new(TransferEngine::new(16), sink.clone(), 16);
        let temp = tempdir().unwrap();
        let target = temp.path().display().to_string();

        let ids = queue
            .enqueue(TransferDirection::Download, &["big.bin".into()], &handle, Some(&target))
            .unwrap();
        for _ in 0..1000 {
            if queue.find(ids[0]).unwrap().transferred_bytes > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        assert_eq!(queue.find(ids[0]).unwrap().state, TransferState::InProgress);

        assert!(queue.cancel(ids[0]));
        assert!(!queue.cancel(ids[0]));
        assert_eq!(queue.find(ids[0]).unwrap().state, TransferState::InProgress);
        assert_eq!(queue.clear_finished(), 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending_counts().downloads, 1);

        queue.wait_idle().await;

        let job = queue.find(ids[0]).unwrap();
        assert_eq!(job.state, TransferState::CancelledByUser);
        assert_eq!(job.result_code, SftpError::TransferCancelled.code());
        assert!(job.finished_at.is_some());
        assert!(job.transferred_bytes < 256 * 1024);
        let notes = sink.notifications();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].contains("Download of big.bin cancelled"));
        assert_eq!(queue.clear_finished(), 1);

        handle.release().await;
    }

    #[tokio::test]
    async fn test_released_session_fails_not_connected() {
        let remote = MockRemote::new();
        remote.add_file("/home/test/a.txt", b"a");
        let handle = connect(&remote).await;
        let session = handle.session().clone();
        handle.release().await;

        let sink = RecordingSink::new();
        let queue = queue(&sink, 16);
        let temp = tempdir().unwrap();
        let target = temp.path().display().to_string();
        let ids = queue
            .enqueue(TransferDirection::Download, &["a.txt".into()], &session, Some(&target))
            .unwrap();
        queue.wait_idle().await;

        let job = queue.find(ids[0]).unwrap();
        assert_eq!(job.state, TransferState::CancelledForErrors);
        assert_eq!(job.result_code, SftpError::NotConnected(String::new()).code());
        assert!(remote.read_opens().is_empty());
    }

    #[tokio::test]
    async fn test_finished_jobs_are_pruned() {
        let remote = MockRemote::new();
        remote.add_file("/home/test/a.txt", b"a");
        let handle = connect(&remote).await;
        let sink = RecordingSink::new();
        let queue = queue(&sink, 2);
        let temp = tempdir().unwrap();
        let target = temp.path().display().to_string();

        let files = vec!["a.txt".to_string(); 4];
        let ids = queue
            .enqueue(TransferDirection::Download, &files, &handle, Some(&target))
            .unwrap();
        queue.wait_idle().await;

        assert_eq!(queue.len(), 2);
        assert!(queue.find(ids[0]).is_none());
        assert_eq!(queue.get(0).unwrap().id, ids[2]);
        assert_eq!(queue.clear_finished(), 2);
        assert!(queue.is_empty());

        handle.release().await;
    }

    #[tokio::test]
    async fn test_upload_accepts_file_uri() {
        let remote = MockRemote::new();
        let handle = connect(&remote).await;
        let sink = RecordingSink::new();
        let queue = queue(&sink, 16);
        let temp = tempdir().unwrap();
        let local = temp.path().join("report.txt");
        std::fs::write(&local, b"quarterly").unwrap();
        let uri = url::Url::from_file_path(&local).unwrap().to_string();

        queue
            .enqueue(TransferDirection::Upload, &[uri], &handle, Some("/srv"))
            .unwrap();
        queue.wait_idle().await;

        assert_eq!(remote.file("/srv/report.txt").unwrap(), b"quarterly");
        handle.release().await;
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(10_000), "9.8 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }
}
