//! 1 Hz heartbeat
//!
//! Each tick advances the checkpoint timestamp and drives one mirror poll.
//! When the keepalive interval has elapsed the pool's keepalive sweep is
//! spawned on its own task, so a slow server never delays mirror polling.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::mirror::MirrorWatcher;
use crate::ssh::ConnectionPool;

/// Tick period
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

#[derive(Default)]
struct HeartbeatStats {
    /// Unix seconds of the last tick
    checkpoint: AtomicI64,
    ticks: AtomicU64,
    keepalives: AtomicU64,
    keepalive_running: AtomicBool,
}

pub struct Heartbeat {
    stats: Arc<HeartbeatStats>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    /// Start ticking. A zero `keepalive_interval` disables keepalives.
    pub fn start(
        watcher: Arc<MirrorWatcher>,
        pool: Arc<ConnectionPool>,
        keepalive_interval: Duration,
    ) -> Self {
        let stats = Arc::new(HeartbeatStats::default());
        let token = CancellationToken::new();

        let task = tokio::spawn(run(
            watcher,
            pool,
            keepalive_interval,
            Arc::clone(&stats),
            token.clone(),
        ));
        info!("Heartbeat started (keepalive every {:?})", keepalive_interval);

        Self {
            stats,
            token,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn checkpoint(&self) -> i64 {
        self.stats.checkpoint.load(Ordering::SeqCst)
    }

    pub fn ticks(&self) -> u64 {
        self.stats.ticks.load(Ordering::SeqCst)
    }

    /// Keepalive sweeps spawned so far
    pub fn keepalives(&self) -> u64 {
        self.stats.keepalives.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stop ticking and wait for the current tick to finish
    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("Heartbeat stopped");
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn run(
    watcher: Arc<MirrorWatcher>,
    pool: Arc<ConnectionPool>,
    keepalive_interval: Duration,
    stats: Arc<HeartbeatStats>,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(HEARTBEAT_PERIOD);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_keepalive = Instant::now();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        stats.checkpoint.store(Utc::now().timestamp(), Ordering::SeqCst);
        stats.ticks.fetch_add(1, Ordering::SeqCst);

        if !keepalive_interval.is_zero() && last_keepalive.elapsed() >= keepalive_interval {
            last_keepalive = Instant::now();
            spawn_keepalive(&pool, &stats);
        }

        let uploaded = watcher.poll_tick().await;
        if uploaded > 0 {
            debug!("Heartbeat tick uploaded {} mirror(s)", uploaded);
        }
    }
}

fn spawn_keepalive(pool: &Arc<ConnectionPool>, stats: &Arc<HeartbeatStats>) {
    // Skip if the previous sweep is still probing
    if stats.keepalive_running.swap(true, Ordering::SeqCst) {
        debug!("Keepalive sweep still running, skipping");
        return;
    }
    stats.keepalives.fetch_add(1, Ordering::SeqCst);

    let pool = Arc::clone(pool);
    let stats = Arc::clone(stats);
    tokio::spawn(async move {
        let failed = pool.keepalive_all().await;
        if failed > 0 {
            debug!("Keepalive sweep: {} session(s) failed", failed);
        }
        stats.keepalive_running.store(false, Ordering::SeqCst);
    });
}
