//! SSH session pool
//!
//! 每个 (host, user) 只保留一条连接，由引用计数决定生命周期。
//!
//! # 架构
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  ConnectionPool                                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │  PoolCore.state: Mutex<TransportState>  (全局锁)    │  │
//! │  │  ├── sessions: Vec<Arc<SessionEntry>>               │  │
//! │  │  └── live: id -> { transport, sftp }                │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//!          │
//!    ┌─────┴──────────┬──────────────┐
//!    ▼                ▼              ▼
//! SessionHandle    TransferJob    MirrorEntry
//!  (counted)       (Session)      (Session)
//! ```
//!
//! Every use of a transport or its SFTP handles happens while holding the
//! single `TransportState` lock, so at most one remote operation is in flight
//! process-wide.
//!
//! # 生命周期
//!
//! - `connect`: 已存在则探活，死连接原地重建（保留计数），然后 +1
//! - `release`: -1，归零时移出池、清理镜像、关闭 SFTP 并断开
//! - 超时：会话标记为无效，下一次使用时重建

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::config::ConnectTarget;
use super::deadline::with_deadline;
use super::error::SshError;
use super::transport::{Connector, Transport};
use crate::sftp::remote::RemoteFs;
use crate::sftp::types::FileInfo;

/// Timeouts applied by the pool
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Bound on connect, authenticate and subsystem start
    pub connect_timeout: Duration,
    /// Bound on channel opens and remote file opens
    pub operation_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(10),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_sessions: usize,
    pub connected_sessions: usize,
    pub invalid_sessions: usize,
    pub total_ref_count: u32,
}

/// Session info for listings
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub ref_count: u32,
    pub valid: bool,
    pub cwd: String,
    pub created_at: String,
    pub last_active: String,
}

/// Current remote directory and its last listing
#[derive(Debug, Clone, Default)]
pub struct RemoteDirectory {
    pub cwd: String,
    pub entries: Vec<FileInfo>,
}

/// Live handles of one pooled session. Only touched under the transport lock.
pub(crate) struct LiveHandles {
    transport: Box<dyn Transport>,
    sftp: Arc<dyn RemoteFs>,
}

/// Everything guarded by the global transport lock
pub(crate) struct TransportState {
    sessions: Vec<Arc<SessionEntry>>,
    live: HashMap<String, LiveHandles>,
}

impl TransportState {
    fn find(&self, host: &str, username: &str) -> Option<Arc<SessionEntry>> {
        self.sessions
            .iter()
            .find(|e| e.target.read().matches(host, username))
            .cloned()
    }

    fn contains(&self, id: &str) -> bool {
        self.sessions.iter().any(|e| e.id == id)
    }
}

/// Shared between the pool and every `Session` clone
pub(crate) struct PoolCore {
    state: Mutex<TransportState>,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
}

impl PoolCore {
    /// Connect, authenticate and start SFTP under the connect timeout.
    /// Returns the live handles and the remote home directory.
    async fn establish(&self, target: &ConnectTarget) -> Result<(LiveHandles, String), SshError> {
        let timeout = self.settings.connect_timeout;

        let transport = with_deadline(timeout, "connect", self.connector.connect(target))
            .await
            .map_err(connect_error)?;

        let sftp = match with_deadline(timeout, "sftp subsystem", transport.open_sftp()).await {
            Ok(sftp) => sftp,
            Err(e) => {
                transport.disconnect().await;
                return Err(connect_error(e));
            }
        };

        let home = match with_deadline(timeout, "canonicalize", sftp.canonicalize(".")).await {
            Ok(path) => path,
            Err(e) => {
                debug!("Could not resolve home directory, using /: {}", e);
                "/".to_string()
            }
        };

        Ok((LiveHandles { transport, sftp }, home))
    }

    /// Replace the live handles of `entry` in place. Ref count is untouched.
    async fn rebuild(
        &self,
        state: &mut TransportState,
        entry: &SessionEntry,
        target: Option<&ConnectTarget>,
    ) -> Result<(), SshError> {
        if let Some(old) = state.live.remove(&entry.id) {
            close_live(&entry.id, old).await;
        }

        if let Some(target) = target {
            *entry.target.write() = target.clone();
        }
        let target = entry.target.read().clone();

        info!("Rebuilding session {} ({}@{})", entry.id, target.username, target.host);
        match self.establish(&target).await {
            Ok((live, _home)) => {
                state.live.insert(entry.id.clone(), live);
                entry.valid.store(true, Ordering::SeqCst);
                entry.update_activity();
                Ok(())
            }
            Err(e) => {
                entry.valid.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

/// Normalize anything that goes wrong while establishing into the three
/// connect outcomes.
fn connect_error(err: SshError) -> SshError {
    match err {
        SshError::AuthenticationFailed(_)
        | SshError::UnknownAuthMethod(_)
        | SshError::ConnectionFailed(_) => err,
        other => SshError::ConnectionFailed(other.to_string()),
    }
}

async fn close_live(id: &str, live: LiveHandles) {
    if let Err(e) = live.sftp.close().await {
        debug!("Session {} SFTP close failed: {}", id, e);
    }
    if live.transport.is_connected() {
        live.transport.disconnect().await;
    }
    debug!("Session {} handles closed", id);
}

/// 单个池化会话
pub struct SessionEntry {
    pub id: String,

    /// Updated when a dead session is rebuilt with fresh credentials
    target: RwLock<ConnectTarget>,

    /// 引用计数，只在全局锁内修改
    ref_count: AtomicU32,

    /// Cleared on timeout or failed probe
    valid: AtomicBool,

    /// 最后活动时间戳（Unix 秒）
    last_active: AtomicU64,

    pub created_at: DateTime<Utc>,

    remote_dir: RwLock<RemoteDirectory>,
}

impl SessionEntry {
    fn new(target: ConnectTarget, home: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            target: RwLock::new(target),
            ref_count: AtomicU32::new(1),
            valid: AtomicBool::new(true),
            last_active: AtomicU64::new(Utc::now().timestamp() as u64),
            created_at: Utc::now(),
            remote_dir: RwLock::new(RemoteDirectory {
                cwd: home,
                entries: Vec::new(),
            }),
        }
    }

    /// 增加引用计数，到上限时拒绝
    fn add_ref(&self) -> Result<u32, SshError> {
        let current = self.ref_count.load(Ordering::SeqCst);
        if current >= u32::MAX - 1 {
            warn!("Session {} ref count at maximum, refusing new reference", self.id);
            return Err(SshError::ConnectionFailed(format!(
                "session {} has too many references",
                self.id
            )));
        }
        let count = self.ref_count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        debug!("Session {} ref count increased to {}", self.id, count);
        self.update_activity();
        Ok(count)
    }

    /// 减少引用计数
    fn release(&self) -> u32 {
        let current = self.ref_count.load(Ordering::SeqCst);
        if current == 0 {
            warn!("Session {} ref count already 0, not decrementing", self.id);
            return 0;
        }
        let count = self.ref_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!("Session {} ref count decreased to {}", self.id, count);
        count
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn update_activity(&self) {
        self.last_active
            .store(Utc::now().timestamp() as u64, Ordering::SeqCst);
    }

    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::SeqCst) as i64
    }

    fn to_info(&self) -> SessionInfo {
        let target = self.target.read();
        let last_active = Utc
            .timestamp_opt(self.last_active(), 0)
            .single()
            .unwrap_or(self.created_at);
        SessionInfo {
            id: self.id.clone(),
            host: target.host.clone(),
            port: target.port,
            username: target.username.clone(),
            ref_count: self.ref_count(),
            valid: self.is_valid(),
            cwd: self.remote_dir.read().cwd.clone(),
            created_at: self.created_at.to_rfc3339(),
            last_active: last_active.to_rfc3339(),
        }
    }
}

/// Uncounted reference to a pooled session.
///
/// Transfer jobs and mirrors hold this. It does not keep the session alive;
/// once the session leaves the pool every operation fails with `NotConnected`.
#[derive(Clone)]
pub struct Session {
    entry: Arc<SessionEntry>,
    core: Arc<PoolCore>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn host(&self) -> String {
        self.entry.target.read().host.clone()
    }

    pub fn username(&self) -> String {
        self.entry.target.read().username.clone()
    }

    pub fn ref_count(&self) -> u32 {
        self.entry.ref_count()
    }

    pub fn is_valid(&self) -> bool {
        self.entry.is_valid()
    }

    pub fn cwd(&self) -> String {
        self.entry.remote_dir.read().cwd.clone()
    }

    /// Last directory listing taken by `change_dir` or `refresh_listing`
    pub fn listing(&self) -> Vec<FileInfo> {
        self.entry.remote_dir.read().entries.clone()
    }

    pub(crate) fn set_remote_dir(&self, cwd: String, entries: Vec<FileInfo>) {
        *self.entry.remote_dir.write() = RemoteDirectory { cwd, entries };
    }

    pub(crate) fn operation_timeout(&self) -> Duration {
        self.core.settings.operation_timeout
    }

    /// Mark the session for rebuild on next use
    pub(crate) fn invalidate(&self) {
        if self.entry.valid.swap(false, Ordering::SeqCst) {
            warn!("Session {} invalidated", self.entry.id);
        }
    }

    /// Take the global transport lock without touching session state.
    pub(crate) async fn lock_transport(&self) -> MutexGuard<'_, TransportState> {
        self.core.state.lock().await
    }

    /// Take the global transport lock and return the session's SFTP handle.
    ///
    /// Fails with `NotConnected` once the session has left the pool. An
    /// invalidated session is rebuilt in place first.
    pub(crate) async fn lock_sftp(
        &self,
    ) -> Result<(MutexGuard<'_, TransportState>, Arc<dyn RemoteFs>), SshError> {
        let mut state = self.core.state.lock().await;
        if !state.contains(&self.entry.id) {
            return Err(SshError::NotConnected(format!(
                "session {} is no longer pooled",
                self.entry.id
            )));
        }

        if !self.entry.is_valid() || !state.live.contains_key(&self.entry.id) {
            self.core.rebuild(&mut state, &self.entry, None).await?;
        }

        let sftp = state
            .live
            .get(&self.entry.id)
            .map(|live| Arc::clone(&live.sftp))
            .ok_or_else(|| SshError::NotConnected(self.entry.id.clone()))?;

        self.entry.update_activity();
        Ok((state, sftp))
    }

    /// Open and close a throwaway channel. A failure invalidates the session.
    pub async fn open_channel(&self) -> Result<(), SshError> {
        let state = self.core.state.lock().await;
        let live = state
            .live
            .get(&self.entry.id)
            .ok_or_else(|| SshError::NotConnected(self.entry.id.clone()))?;

        match with_deadline(self.operation_timeout(), "channel open", live.transport.probe()).await
        {
            Ok(()) => {
                self.entry.update_activity();
                Ok(())
            }
            Err(e) => {
                self.invalidate();
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.entry.id)
            .field("target", &*self.entry.target.read())
            .finish()
    }
}

/// Called when a session's ref count reaches zero, before its handles close
#[async_trait]
pub trait SessionReleaseHook: Send + Sync {
    async fn on_session_released(&self, session_id: &str);
}

/// Counted owner of a pooled session.
///
/// Release with [`SessionHandle::release`]. Dropping without releasing falls
/// back to a spawned release when a runtime is available.
pub struct SessionHandle {
    session: Session,
    pool: Arc<ConnectionPool>,
    released: bool,
}

impl SessionHandle {
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Give up this reference. Returns the remaining ref count.
    pub async fn release(mut self) -> u32 {
        self.released = true;
        self.pool.release(&self.session).await
    }
}

impl std::ops::Deref for SessionHandle {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("SessionHandle for {} dropped without release", self.session.id());
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let pool = Arc::clone(&self.pool);
            let session = self.session.clone();
            rt.spawn(async move {
                pool.release(&session).await;
            });
        }
    }
}

/// The process-wide session pool
pub struct ConnectionPool {
    core: Arc<PoolCore>,
    release_hook: RwLock<Option<Arc<dyn SessionReleaseHook>>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, settings: PoolSettings) -> Arc<Self> {
        Arc::new(Self {
            core: Arc::new(PoolCore {
                state: Mutex::new(TransportState {
                    sessions: Vec::new(),
                    live: HashMap::new(),
                }),
                connector,
                settings,
            }),
            release_hook: RwLock::new(None),
        })
    }

    pub fn settings(&self) -> PoolSettings {
        self.core.settings
    }

    pub fn set_release_hook(&self, hook: Arc<dyn SessionReleaseHook>) {
        *self.release_hook.write() = Some(hook);
    }

    fn handle_for(self: &Arc<Self>, entry: Arc<SessionEntry>) -> SessionHandle {
        SessionHandle {
            session: Session {
                entry,
                core: Arc::clone(&self.core),
            },
            pool: Arc::clone(self),
            released: false,
        }
    }

    /// Get or create the pooled session for (host, user).
    ///
    /// An existing session is probed first; a dead one is rebuilt in place
    /// keeping its ref count. The caller's reference is added afterwards.
    pub async fn connect(self: &Arc<Self>, target: ConnectTarget) -> Result<SessionHandle, SshError> {
        let mut state = self.core.state.lock().await;

        if let Some(entry) = state.find(&target.host, &target.username) {
            let alive = match state.live.get(&entry.id) {
                Some(live) if entry.is_valid() => {
                    match with_deadline(
                        self.core.settings.operation_timeout,
                        "liveness probe",
                        live.transport.probe(),
                    )
                    .await
                    {
                        Ok(()) => true,
                        Err(e) => {
                            info!("Session {} failed liveness probe: {}", entry.id, e);
                            false
                        }
                    }
                }
                _ => false,
            };

            if !alive {
                self.core.rebuild(&mut state, &entry, Some(&target)).await?;
            }

            let count = entry.add_ref()?;
            info!(
                "Reusing session {} for {}@{} (ref_count={})",
                entry.id, target.username, target.host, count
            );
            return Ok(self.handle_for(entry));
        }

        let (live, home) = self.core.establish(&target).await?;
        let entry = Arc::new(SessionEntry::new(target, home));
        info!(
            "Session {} established for {}",
            entry.id,
            entry.target.read().address()
        );
        state.live.insert(entry.id.clone(), live);
        state.sessions.push(Arc::clone(&entry));

        Ok(self.handle_for(entry))
    }

    /// Add a counted reference to a session that is still pooled.
    pub async fn retain(self: &Arc<Self>, session: &Session) -> Result<SessionHandle, SshError> {
        let state = self.core.state.lock().await;
        if !state.contains(session.id()) {
            return Err(SshError::NotConnected(session.id().to_string()));
        }
        session.entry.add_ref()?;
        Ok(self.handle_for(Arc::clone(&session.entry)))
    }

    /// Drop one reference. At zero the session leaves the pool, its mirrors
    /// are cleared and its handles are closed. Returns the remaining count.
    pub(crate) async fn release(&self, session: &Session) -> u32 {
        let id = session.id().to_string();

        let live = {
            let mut state = self.core.state.lock().await;
            if !state.contains(&id) {
                debug!("Session {} already left the pool", id);
                return 0;
            }
            let count = session.entry.release();
            if count > 0 {
                return count;
            }
            state.sessions.retain(|e| e.id != id);
            session.entry.valid.store(false, Ordering::SeqCst);
            state.live.remove(&id)
        };

        info!("Session {} released, tearing down", id);

        let hook = self.release_hook.read().clone();
        if let Some(hook) = hook {
            hook.on_session_released(&id).await;
        }

        if let Some(live) = live {
            let _state = self.core.state.lock().await;
            close_live(&id, live).await;
        }
        0
    }

    /// Probe one session. Failure marks it invalid; the handles stay until
    /// the next use rebuilds them.
    pub async fn keepalive(&self, session: &Session) -> Result<(), SshError> {
        session.open_channel().await
    }

    /// Probe every pooled session, one lock acquisition per session.
    pub async fn keepalive_all(&self) -> usize {
        let entries: Vec<Arc<SessionEntry>> = {
            let state = self.core.state.lock().await;
            state.sessions.clone()
        };

        let mut failed = 0;
        for entry in entries {
            let session = Session {
                entry,
                core: Arc::clone(&self.core),
            };
            if let Err(e) = session.open_channel().await {
                debug!("Keepalive failed for session {}: {}", session.id(), e);
                failed += 1;
            }
        }
        failed
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.core.state.lock().await;
        let mut stats = PoolStats {
            total_sessions: state.sessions.len(),
            connected_sessions: 0,
            invalid_sessions: 0,
            total_ref_count: 0,
        };
        for entry in &state.sessions {
            stats.total_ref_count = stats.total_ref_count.saturating_add(entry.ref_count());
            if !entry.is_valid() {
                stats.invalid_sessions += 1;
            }
            if state
                .live
                .get(&entry.id)
                .map(|live| live.transport.is_connected())
                .unwrap_or(false)
            {
                stats.connected_sessions += 1;
            }
        }
        stats
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let state = self.core.state.lock().await;
        state.sessions.iter().map(|e| e.to_info()).collect()
    }

    /// Find the pooled session for (host, user) without adding a reference
    pub async fn find(&self, host: &str, username: &str) -> Option<Session> {
        let state = self.core.state.lock().await;
        state.find(host, username).map(|entry| Session {
            entry,
            core: Arc::clone(&self.core),
        })
    }

    /// Tear down every session regardless of ref counts.
    pub async fn shutdown(&self) {
        let drained: Vec<(Arc<SessionEntry>, Option<LiveHandles>)> = {
            let mut state = self.core.state.lock().await;
            let sessions = std::mem::take(&mut state.sessions);
            sessions
                .into_iter()
                .map(|entry| {
                    let live = state.live.remove(&entry.id);
                    (entry, live)
                })
                .collect()
        };

        if drained.is_empty() {
            return;
        }
        info!("Shutting down {} pooled session(s)", drained.len());

        let hook = self.release_hook.read().clone();
        for (entry, live) in drained {
            entry.ref_count.store(0, Ordering::SeqCst);
            entry.valid.store(false, Ordering::SeqCst);
            if let Some(hook) = &hook {
                hook.on_session_released(&entry.id).await;
            }
            if let Some(live) = live {
                let _state = self.core.state.lock().await;
                close_live(&entry.id, live).await;
            }
        }
    }
}
