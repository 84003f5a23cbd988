//! Background context
//!
//! Owns the pool, the transfer queue, the mirror watcher and the heartbeat.
//! One context per process; nothing here is global.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::ClientConfig;
use crate::heartbeat::Heartbeat;
use crate::mirror::{
    CommandEditorLauncher, EditorLauncher, MirrorInfo, MirrorWatcher, NoEditor,
};
use crate::sftp::{SftpError, TransferDirection, TransferEngine, TransferQueue};
use crate::ssh::{
    ConnectTarget, ConnectionPool, Connector, RusshConnector, Session, SessionHandle, SshError,
};
use crate::status::{DeliveryMode, StatusSink, TracingStatusSink};

pub struct BackgroundContext {
    config: ClientConfig,
    pool: Arc<ConnectionPool>,
    queue: Arc<TransferQueue>,
    mirrors: Arc<MirrorWatcher>,
    status: Arc<dyn StatusSink>,
    heartbeat: Mutex<Option<Heartbeat>>,
}

impl BackgroundContext {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        status: Arc<dyn StatusSink>,
        launcher: Arc<dyn EditorLauncher>,
    ) -> Self {
        let engine = TransferEngine::new(config.transfer.chunk_size);
        let pool = ConnectionPool::new(connector, config.connection.pool_settings());
        let queue = TransferQueue::new(
            engine,
            Arc::clone(&status),
            config.transfer.max_finished_jobs,
        );
        let mirrors = Arc::new(MirrorWatcher::new(
            engine,
            config.mirror.temp_root.clone(),
            launcher,
            Arc::clone(&status),
        ));
        pool.set_release_hook(mirrors.clone());

        Self {
            config,
            pool,
            queue,
            mirrors,
            status,
            heartbeat: Mutex::new(None),
        }
    }

    /// russh connector, log-backed status and the configured editor
    pub fn with_defaults(config: ClientConfig) -> Self {
        let launcher: Arc<dyn EditorLauncher> =
            match CommandEditorLauncher::new(&config.mirror.editor_command) {
                Some(launcher) => Arc::new(launcher),
                None => Arc::new(NoEditor),
            };
        Self::new(
            config,
            Arc::new(RusshConnector::new()),
            Arc::new(TracingStatusSink),
            launcher,
        )
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn queue(&self) -> &Arc<TransferQueue> {
        &self.queue
    }

    pub fn mirrors(&self) -> &Arc<MirrorWatcher> {
        &self.mirrors
    }

    pub async fn connect(&self, target: ConnectTarget) -> Result<SessionHandle, SshError> {
        self.status.status(
            &format!("Connecting to {}@{}...", target.username, target.host),
            DeliveryMode::Immediate,
        );
        match self.pool.connect(target).await {
            Ok(handle) => {
                self.status
                    .status(&format!("Connected ({})", handle.cwd()), DeliveryMode::Immediate);
                Ok(handle)
            }
            Err(e) => {
                self.status
                    .status(&format!("Connection failed: {}", e), DeliveryMode::Immediate);
                Err(e)
            }
        }
    }

    pub fn enqueue(
        &self,
        direction: TransferDirection,
        files: &[String],
        session: &Session,
        target_dir: Option<&str>,
    ) -> Result<Vec<u64>, SftpError> {
        self.queue.enqueue(direction, files, session, target_dir)
    }

    pub async fn open_mirror(
        &self,
        session: &Session,
        remote_filename: &str,
    ) -> Result<MirrorInfo, SftpError> {
        let info = self.mirrors.create_mirror(session, remote_filename).await?;
        self.status.status(
            &format!("Editing {} ({})", info.remote_path, info.local_path.display()),
            DeliveryMode::Immediate,
        );
        Ok(info)
    }

    /// Start the 1 Hz heartbeat if it is not running yet
    pub fn start_heartbeat(&self) {
        let mut heartbeat = self.heartbeat.lock();
        if heartbeat.is_some() {
            return;
        }
        *heartbeat = Some(Heartbeat::start(
            Arc::clone(&self.mirrors),
            Arc::clone(&self.pool),
            self.config.connection.keepalive_interval(),
        ));
    }

    pub fn heartbeat_ticks(&self) -> u64 {
        self.heartbeat.lock().as_ref().map(Heartbeat::ticks).unwrap_or(0)
    }

    /// Stop the heartbeat, cancel transfers, clear mirrors and close every
    /// session.
    pub async fn shutdown(&self) {
        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            heartbeat.stop().await;
        }

        let cancelled = self.queue.cancel_all();
        if cancelled > 0 {
            info!("Cancelled {} pending transfer(s)", cancelled);
        }
        self.queue.wait_idle().await;

        self.mirrors.clear_all().await;
        self.pool.shutdown().await;
        info!("Background context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::TransferState;
    use crate::testing::{bump_mtime, MockConnector, MockRemote, RecordingSink};
    use std::time::Duration;
    use tempfile::tempdir;

    fn context(
        remote: &Arc<MockRemote>,
        temp: &tempfile::TempDir,
    ) -> (BackgroundContext, Arc<RecordingSink>) {
        let mut config = ClientConfig::default();
        config.mirror.temp_root = temp.path().join("mirrors");
        config.connection.keepalive_interval_secs = 0;
        let sink = RecordingSink::new();
        let ctx = BackgroundContext::new(
            config,
            Arc::new(MockConnector::new(Arc::clone(remote))),
            sink.clone(),
            Arc::new(NoEditor),
        );
        (ctx, sink)
    }

    fn target() -> ConnectTarget {
        ConnectTarget::new("example.org", "alice").with_credential("pw")
    }

    #[tokio::test]
    async fn test_connect_reports_status() {
        let remote = MockRemote::new();
        let temp = tempdir().unwrap();
        let (ctx, sink) = context(&remote, &temp);

        let handle = ctx.connect(target()).await.unwrap();
        let statuses = sink.statuses();
        assert_eq!(statuses[0].0, "Connecting to alice@example.org...");
        assert_eq!(statuses[0].1, DeliveryMode::Immediate);
        assert_eq!(statuses[1].0, "Connected (/home/test)");

        handle.release().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_uploads_edited_mirror() {
        let remote = MockRemote::new();
        remote.add_file("/home/test/notes.txt", b"hello");
        let temp = tempdir().unwrap();
        let (ctx, _sink) = context(&remote, &temp);

        let handle = ctx.connect(target()).await.unwrap();
        let info = ctx.open_mirror(&handle, "notes.txt").await.unwrap();
        ctx.start_heartbeat();

        std::fs::write(&info.local_path, b"changed").unwrap();
        bump_mtime(&info.local_path, Duration::from_secs(5));

        for _ in 0..50 {
            if ctx.mirrors().upload_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(ctx.mirrors().upload_count(), 1);
        assert_eq!(remote.file("/home/test/notes.txt").unwrap(), b"changed");
        assert!(ctx.heartbeat_ticks() >= 1);

        handle.release().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_tears_everything_down() {
        let remote = MockRemote::new();
        remote.add_file("/home/test/a.txt", b"a");
        let temp = tempdir().unwrap();
        let (ctx, _sink) = context(&remote, &temp);

        let handle = ctx.connect(target()).await.unwrap();
        let info = ctx.open_mirror(&handle, "a.txt").await.unwrap();
        let target_dir = temp.path().display().to_string();
        let ids = ctx
            .enqueue(
                TransferDirection::Download,
                &["a.txt".to_string()],
                &handle,
                Some(&target_dir),
            )
            .unwrap();
        let session = handle.session().clone();
        // Keep the counted reference alive past shutdown
        std::mem::forget(handle);

        ctx.shutdown().await;

        let job = ctx.queue().find(ids[0]).unwrap();
        assert_eq!(job.state, TransferState::CancelledByUser);
        assert!(ctx.mirrors().is_empty());
        assert!(!info.local_path.exists());
        assert_eq!(ctx.pool().stats().await.total_sessions, 0);
        assert!(matches!(
            session.stat("/home/test").await,
            Err(SftpError::NotConnected(_))
        ));
    }
}
