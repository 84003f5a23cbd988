//! In-memory remote host for unit tests
//!
//! `MockRemote` is the server-side state: a flat map of paths to files and
//! directories plus counters for everything the pool and transfers do to it.
//! `MockConnector` hands out transports backed by it.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::sftp::path_utils::{remote_file_name, resolve_remote_path};
use crate::sftp::{FileInfo, FileType, RemoteFile, RemoteFs, SftpError};
use crate::ssh::{ConnectTarget, Connector, SshError, Transport};
use crate::status::{DeliveryMode, StatusSink};

const HOME: &str = "/home/test";

enum Node {
    Dir,
    File(Vec<u8>),
}

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    sftp_closes: AtomicUsize,
    probes: AtomicUsize,
    write_calls: AtomicUsize,
    open_files: AtomicUsize,
    max_open_files: AtomicUsize,
}

pub struct MockRemote {
    nodes: Mutex<BTreeMap<String, Node>>,
    failing_writes: Mutex<HashSet<String>>,
    write_opens: Mutex<Vec<String>>,
    read_opens: Mutex<Vec<String>>,
    alive: AtomicBool,
    reject_auth: AtomicBool,
    fail_sftp: AtomicBool,
    stalled_writes: AtomicBool,
    hang: AtomicBool,
    write_cap: AtomicUsize,
    counters: Counters,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        let remote = Self {
            nodes: Mutex::new(BTreeMap::new()),
            failing_writes: Mutex::new(HashSet::new()),
            write_opens: Mutex::new(Vec::new()),
            read_opens: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
            reject_auth: AtomicBool::new(false),
            fail_sftp: AtomicBool::new(false),
            stalled_writes: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            write_cap: AtomicUsize::new(usize::MAX),
            counters: Counters::default(),
        };
        remote.add_dir(HOME);
        Arc::new(remote)
    }

    /// Create a directory and its ancestors
    pub fn add_dir(&self, path: &str) {
        let mut nodes = self.nodes.lock();
        for dir in ancestors(path) {
            nodes.entry(dir).or_insert(Node::Dir);
        }
    }

    /// Create a file, creating missing parent directories
    pub fn add_file(&self, path: &str, content: &[u8]) {
        let mut nodes = self.nodes.lock();
        let path = normalize(path);
        for dir in ancestors(parent_of(&path)) {
            nodes.entry(dir).or_insert(Node::Dir);
        }
        nodes.insert(path, Node::File(content.to_vec()));
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(&normalize(path)) {
            Some(Node::File(data)) => Some(data.clone()),
            _ => None,
        }
    }

    /// Make every open-for-write of `path` fail
    pub fn fail_write_open(&self, path: &str) {
        self.failing_writes.lock().insert(normalize(path));
    }

    pub fn clear_failures(&self) {
        self.failing_writes.lock().clear();
    }

    /// A dead remote fails every liveness probe
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub fn set_fail_sftp(&self, fail: bool) {
        self.fail_sftp.store(fail, Ordering::SeqCst);
    }

    /// Accept nothing on every write
    pub fn set_stalled_writes(&self, stalled: bool) {
        self.stalled_writes.store(stalled, Ordering::SeqCst);
    }

    /// Accept at most `cap` bytes per write call
    pub fn set_write_cap(&self, cap: usize) {
        self.write_cap.store(cap.max(1), Ordering::SeqCst);
    }

    /// Probes, filesystem calls and file I/O never complete while set
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.counters.disconnects.load(Ordering::SeqCst)
    }

    pub fn sftp_closes(&self) -> usize {
        self.counters.sftp_closes.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.counters.probes.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.counters.write_calls.load(Ordering::SeqCst)
    }

    /// Remote files currently open
    pub fn open_files(&self) -> usize {
        self.counters.open_files.load(Ordering::SeqCst)
    }

    /// Highest number of remote files open at once
    pub fn max_open_files(&self) -> usize {
        self.counters.max_open_files.load(Ordering::SeqCst)
    }

    /// Paths opened for writing, in order, including failed opens
    pub fn write_opens(&self) -> Vec<String> {
        self.write_opens.lock().clone()
    }

    /// Paths opened for reading, in order
    pub fn read_opens(&self) -> Vec<String> {
        self.read_opens.lock().clone()
    }

    fn info(&self, path: &str, node: &Node) -> FileInfo {
        let (file_type, size, permissions) = match node {
            Node::Dir => (FileType::Directory, 4096, "755"),
            Node::File(data) => (FileType::File, data.len() as u64, "644"),
        };
        FileInfo {
            name: remote_file_name(path).unwrap_or("/").to_string(),
            path: path.to_string(),
            file_type,
            size,
            modified: 0,
            permissions: permissions.to_string(),
            owner: Some("1000".to_string()),
            group: Some("1000".to_string()),
        }
    }

    async fn stall(&self) {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    fn opened(&self) {
        let open = self.counters.open_files.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_open_files.fetch_max(open, Ordering::SeqCst);
    }

    fn closed(&self) {
        self.counters.open_files.fetch_sub(1, Ordering::SeqCst);
    }
}

fn normalize(path: &str) -> String {
    resolve_remote_path(HOME, path)
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// `path` and every directory above it, root first
fn ancestors(path: &str) -> Vec<String> {
    let path = normalize(path);
    let mut dirs = vec!["/".to_string()];
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        dirs.push(current.clone());
    }
    dirs
}

pub struct MockConnector {
    remote: Arc<MockRemote>,
}

impl MockConnector {
    pub fn new(remote: Arc<MockRemote>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn Transport>, SshError> {
        if self.remote.reject_auth.load(Ordering::SeqCst) {
            return Err(SshError::AuthenticationFailed(format!(
                "server rejected credentials for {}",
                target.username
            )));
        }
        self.remote.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTransport {
            remote: Arc::clone(&self.remote),
            connected: AtomicBool::new(true),
        }))
    }
}

struct MockTransport {
    remote: Arc<MockRemote>,
    connected: AtomicBool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn probe(&self) -> Result<(), SshError> {
        self.remote.counters.probes.fetch_add(1, Ordering::SeqCst);
        self.remote.stall().await;
        if !self.remote.alive.load(Ordering::SeqCst) || !self.is_connected() {
            return Err(SshError::ChannelError("channel open refused".to_string()));
        }
        Ok(())
    }

    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>, SshError> {
        if self.remote.fail_sftp.load(Ordering::SeqCst) {
            return Err(SshError::ChannelError("subsystem request failed".to_string()));
        }
        Ok(Arc::new(MockFs {
            remote: Arc::clone(&self.remote),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.remote.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct MockFs {
    remote: Arc<MockRemote>,
}

#[async_trait]
impl RemoteFs for MockFs {
    async fn canonicalize(&self, path: &str) -> Result<String, SftpError> {
        self.remote.stall().await;
        let path = normalize(path);
        if self.remote.nodes.lock().contains_key(&path) {
            Ok(path)
        } else {
            Err(SftpError::FileNotFound(path))
        }
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, SftpError> {
        self.remote.stall().await;
        let path = normalize(path);
        let nodes = self.remote.nodes.lock();
        match nodes.get(&path) {
            Some(node) => Ok(self.remote.info(&path, node)),
            None => Err(SftpError::FileNotFound(path)),
        }
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileInfo>, SftpError> {
        self.remote.stall().await;
        let path = normalize(path);
        let nodes = self.remote.nodes.lock();
        match nodes.get(&path) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => {
                return Err(SftpError::InvalidPath(format!("{} is not a directory", path)))
            }
            None => return Err(SftpError::FileNotFound(path)),
        }
        Ok(nodes
            .iter()
            .filter(|(child, _)| child.as_str() != path && parent_of(child) == path)
            .map(|(child, node)| self.remote.info(child, node))
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        let path = normalize(path);
        let mut nodes = self.remote.nodes.lock();
        if nodes.contains_key(&path) {
            return Err(SftpError::DirectoryCreateFailed {
                path,
                message: "file exists".to_string(),
            });
        }
        nodes.insert(path, Node::Dir);
        Ok(())
    }

    async fn open_read(&self, path: &str) -> Result<Box<dyn RemoteFile>, SftpError> {
        self.remote.stall().await;
        let path = normalize(path);
        self.remote.read_opens.lock().push(path.clone());
        let data = match self.remote.nodes.lock().get(&path) {
            Some(Node::File(data)) => data.clone(),
            Some(Node::Dir) => {
                return Err(SftpError::InvalidPath(format!("{} is a directory", path)))
            }
            None => return Err(SftpError::FileNotFound(path)),
        };
        self.remote.opened();
        Ok(Box::new(MockFile {
            remote: Arc::clone(&self.remote),
            path,
            data,
            pos: 0,
            open: true,
        }))
    }

    async fn open_write(&self, path: &str) -> Result<Box<dyn RemoteFile>, SftpError> {
        self.remote.stall().await;
        let path = normalize(path);
        self.remote.write_opens.lock().push(path.clone());
        if self.remote.failing_writes.lock().contains(&path) {
            return Err(SftpError::ProtocolError("permission denied".to_string()));
        }
        {
            let mut nodes = self.remote.nodes.lock();
            if let Some(Node::Dir) = nodes.get(&path) {
                return Err(SftpError::InvalidPath(format!("{} is a directory", path)));
            }
            nodes.insert(path.clone(), Node::File(Vec::new()));
        }
        self.remote.opened();
        Ok(Box::new(MockFile {
            remote: Arc::clone(&self.remote),
            path,
            data: Vec::new(),
            pos: 0,
            open: true,
        }))
    }

    async fn close(&self) -> Result<(), SftpError> {
        self.remote.counters.sftp_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockFile {
    remote: Arc<MockRemote>,
    path: String,
    /// Snapshot taken at open, for reads
    data: Vec<u8>,
    pos: usize,
    open: bool,
}

#[async_trait]
impl RemoteFile for MockFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SftpError> {
        self.remote.stall().await;
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<usize, SftpError> {
        self.remote.stall().await;
        self.remote.counters.write_calls.fetch_add(1, Ordering::SeqCst);
        let accepted = if self.remote.stalled_writes.load(Ordering::SeqCst) {
            0
        } else {
            buf.len().min(self.remote.write_cap.load(Ordering::SeqCst))
        };
        if let Some(Node::File(data)) = self.remote.nodes.lock().get_mut(&self.path) {
            data.extend_from_slice(&buf[..accepted]);
        }
        Ok(accepted)
    }

    async fn close(&mut self) -> Result<(), SftpError> {
        if std::mem::replace(&mut self.open, false) {
            self.remote.closed();
        }
        Ok(())
    }
}

impl Drop for MockFile {
    fn drop(&mut self) {
        if self.open {
            self.remote.closed();
        }
    }
}

/// Sink that records everything it is given
#[derive(Default)]
pub struct RecordingSink {
    statuses: Mutex<Vec<(String, DeliveryMode)>>,
    notifications: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn statuses(&self) -> Vec<(String, DeliveryMode)> {
        self.statuses.lock().clone()
    }

    pub fn notifications(&self) -> Vec<String> {
        self.notifications.lock().clone()
    }
}

impl StatusSink for RecordingSink {
    fn status(&self, message: &str, mode: DeliveryMode) {
        self.statuses.lock().push((message.to_string(), mode));
    }

    fn notify(&self, summary: &str) {
        self.notifications.lock().push(summary.to_string());
    }
}

/// Move a file's mtime `by` into the future and return what the filesystem
/// now reports.
pub fn bump_mtime(path: &Path, by: Duration) -> SystemTime {
    let current = std::fs::metadata(path).unwrap().modified().unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(current + by).unwrap();
    drop(file);
    std::fs::metadata(path).unwrap().modified().unwrap()
}
