//! Per-name re-entrant locking.
//!
//! Within a process, each (store, name) pair has a FIFO gate. A call chain
//! that already holds the gate re-enters without waiting: chain membership is
//! carried in a task-local set that is visible to everything awaited inside
//! the locked work, and invisible to unrelated futures even when they are
//! polled on the same task.
//!
//! Across processes, the holder owns `<name>.json.lock`, created with
//! `create_new` and stamped with the holder's pid and a per-grant nonce.
//! While held, the holder touches the file so its mtime stays fresh. Waiters
//! poll with capped exponential backoff; a sentinel whose mtime is older than
//! the configured threshold belonged to a holder that died and is taken over.
//!
//! Takeover and release both move the file aside under a unique name before
//! inspecting it, so they never delete a sentinel another holder just
//! created. A file that turns out to be live or foreign is linked back.

use super::ConfigStore;
use crate::config::LockConfig;
use crate::error::{Result, StoreError};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Floor for the sentinel refresh period.
const MIN_REFRESH: Duration = Duration::from_millis(10);

tokio::task_local! {
    /// Locks held by the enclosing `with_lock` chain.
    static HELD: HashSet<HeldLock>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HeldLock {
    manager: u64,
    name: String,
}

/// Grant state for one name.
struct Grant {
    /// Tokio's mutex queues waiters in arrival order.
    gate: Arc<Mutex<()>>,
    depth: AtomicUsize,
}

/// Holder identity written into the sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    nonce: Uuid,
    acquired_at: u64,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            nonce: Uuid::new_v4(),
            acquired_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

/// Lock table owned by one store instance.
pub(crate) struct LockManager {
    id: u64,
    settings: LockConfig,
    grants: DashMap<String, Arc<Grant>>,
}

impl LockManager {
    pub(crate) fn new(settings: LockConfig) -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            settings,
            grants: DashMap::new(),
        }
    }

    fn lease<'a>(&'a self, name: &'a str) -> Lease<'a> {
        let grant = Arc::clone(&self.grants.entry(name.to_string()).or_insert_with(|| {
            Arc::new(Grant {
                gate: Arc::new(Mutex::new(())),
                depth: AtomicUsize::new(0),
            })
        }));
        Lease {
            locks: self,
            name,
            grant,
        }
    }

    fn key(&self, name: &str) -> HeldLock {
        HeldLock {
            manager: self.id,
            name: name.to_string(),
        }
    }

    /// Whether the current call chain already holds `name`.
    fn held_by_current_chain(&self, name: &str) -> bool {
        let key = self.key(name);
        HELD.try_with(|held| held.contains(&key)).unwrap_or(false)
    }

    pub(crate) fn depth(&self, name: &str) -> usize {
        self.grants
            .get(name)
            .map(|grant| grant.depth.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Create the sentinel, waiting out other processes that hold it.
    async fn acquire_sentinel(&self, path: &Path) -> Result<Sentinel> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let owner = LockOwner::current();
        let body = serde_json::to_vec(&owner).map_err(StoreError::Serialize)?;

        let mut attempt: u32 = 0;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    let written = async {
                        file.write_all(&body).await?;
                        file.flush().await
                    };
                    if let Err(e) = written.await {
                        let _ = tokio::fs::remove_file(path).await;
                        return Err(StoreError::io(path, e));
                    }
                    return Ok(Sentinel::new(path, owner.nonce, self.refresh_every()));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.is_stale(path).await && self.take_over(path).await? {
                        continue;
                    }
                    attempt = attempt.saturating_add(1);
                    if attempt == 1 {
                        debug!(path = %path.display(), "Lock file held elsewhere, waiting");
                    }
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }
    }

    async fn is_stale(&self, path: &Path) -> bool {
        let Some(limit) = self.settings.stale_after() else {
            return false;
        };
        match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => older_than(modified, limit),
            Err(_) => false,
        }
    }

    /// Remove an abandoned sentinel. Returns whether the path is now free.
    async fn take_over(&self, path: &Path) -> Result<bool> {
        let Some(limit) = self.settings.stale_after() else {
            return Ok(false);
        };
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || take_over_stale(&target, limit))
            .await
            .map_err(|e| StoreError::io(path, io::Error::other(e)))?
            .map_err(|e| StoreError::io(path, e))
    }

    /// How often a held sentinel is touched. `None` when nothing goes stale.
    fn refresh_every(&self) -> Option<Duration> {
        self.settings
            .stale_after()
            .map(|limit| (limit / 3).max(MIN_REFRESH))
    }

    /// Exponential poll delay with up to 10% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.poll_interval_ms.max(1);
        let max = self.settings.max_poll_interval_ms.max(base);

        let exponential = 2u64.saturating_pow(attempt.saturating_sub(1).min(32));
        let delay = base.saturating_mul(exponential).min(max);

        let jitter_range = delay / 10;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..jitter_range)
        } else {
            0
        };

        Duration::from_millis(delay + jitter)
    }
}

fn older_than(modified: SystemTime, limit: Duration) -> bool {
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > limit)
        .unwrap_or(false)
}

/// Unique sibling name used while a sentinel is inspected.
fn aside_path(path: &Path) -> PathBuf {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{file}.{}.aside", Uuid::new_v4().simple()))
}

/// Move `path` aside. `None` when there was nothing to move.
fn set_aside(path: &Path) -> io::Result<Option<PathBuf>> {
    let aside = aside_path(path);
    match std::fs::rename(path, &aside) {
        Ok(()) => Ok(Some(aside)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Put a sentinel moved aside back, unless its path was claimed meanwhile.
fn restore(aside: &Path, path: &Path) {
    match std::fs::hard_link(aside, path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            warn!(path = %path.display(), "Lock file reclaimed while set aside");
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to restore lock file");
        }
    }
    if let Err(e) = std::fs::remove_file(aside) {
        warn!(path = %aside.display(), error = %e, "Failed to remove set-aside lock file");
    }
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let body = std::fs::read(path).ok()?;
    serde_json::from_slice(&body).ok()
}

fn take_over_stale(path: &Path, limit: Duration) -> io::Result<bool> {
    let Some(aside) = set_aside(path)? else {
        return Ok(true);
    };
    let stale = std::fs::metadata(&aside)
        .and_then(|m| m.modified())
        .map(|modified| older_than(modified, limit))
        .unwrap_or(false);
    if !stale {
        // Refreshed by its holder after the first check.
        restore(&aside, path);
        return Ok(false);
    }
    match read_owner(&aside) {
        Some(owner) => warn!(
            path = %path.display(),
            pid = owner.pid,
            acquired_at = owner.acquired_at,
            "Taking over stale lock file"
        ),
        None => warn!(path = %path.display(), "Taking over stale lock file"),
    }
    match std::fs::remove_file(&aside) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}

fn touch_if_owned(path: &Path, nonce: Uuid) -> io::Result<bool> {
    if read_owner(path).map(|owner| owner.nonce) != Some(nonce) {
        return Ok(false);
    }
    std::fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())?;
    Ok(true)
}

fn remove_if_owned(path: &Path, nonce: Uuid) -> io::Result<bool> {
    let Some(aside) = set_aside(path)? else {
        return Ok(false);
    };
    if read_owner(&aside).is_some_and(|owner| owner.nonce == nonce) {
        std::fs::remove_file(&aside)?;
        Ok(true)
    } else {
        restore(&aside, path);
        Ok(false)
    }
}

async fn keep_fresh(path: PathBuf, nonce: Uuid, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let target = path.clone();
        match tokio::task::spawn_blocking(move || touch_if_owned(&target, nonce)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                warn!(path = %path.display(), "Lock file no longer ours, stopping refresh");
                return;
            }
            Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Failed to refresh lock file"),
            Err(_) => return,
        }
    }
}

/// On-disk lock marker owned by one grant.
struct Sentinel {
    path: PathBuf,
    nonce: Uuid,
    refresh: Option<JoinHandle<()>>,
    released: bool,
}

impl Sentinel {
    fn new(path: &Path, nonce: Uuid, refresh_every: Option<Duration>) -> Self {
        let refresh = refresh_every
            .map(|every| tokio::spawn(keep_fresh(path.to_path_buf(), nonce, every)));
        Self {
            path: path.to_path_buf(),
            nonce,
            refresh,
            released: false,
        }
    }

    fn stop_refresh(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
    }

    /// Remove the sentinel if it is still ours.
    async fn release(mut self) {
        self.stop_refresh();
        let (path, nonce) = (self.path.clone(), self.nonce);
        let outcome = tokio::task::spawn_blocking(move || remove_if_owned(&path, nonce))
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e)));
        report_release(&self.path, outcome);
        self.released = true;
    }
}

fn report_release(path: &Path, outcome: io::Result<bool>) {
    match outcome {
        Ok(true) => {}
        Ok(false) => warn!(path = %path.display(), "Lock file was taken over before release"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove lock file"),
    }
}

impl Drop for Sentinel {
    /// Fallback for cancelled work; unlinks on the current thread.
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.stop_refresh();
        report_release(&self.path, remove_if_owned(&self.path, self.nonce));
    }
}

/// A caller's claim on a grant. The last lease out drops the table entry.
struct Lease<'a> {
    locks: &'a LockManager,
    name: &'a str,
    grant: Arc<Grant>,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        // One reference in the table, one here: nobody is waiting or nested.
        self.locks.grants.remove_if(self.name, |_, grant| {
            Arc::ptr_eq(grant, &self.grant) && Arc::strong_count(grant) == 2
        });
    }
}

/// Decrements the grant depth on drop.
struct DepthGuard<'a>(&'a Grant);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConfigStore {
    /// Run `work` while holding the lock on `name`.
    ///
    /// A fresh grant creates `<name>.json.lock` and drops the cached document
    /// for `name`, so reads inside `work` see the file as it is now. Calls
    /// made from inside `work` on the same name re-enter the held grant. Other
    /// callers wait their turn in arrival order.
    ///
    /// The lock is released when `work` finishes, fails, or is dropped, and
    /// the result of `work` is returned unchanged.
    pub async fn with_lock<F, Fut, T, E>(&self, name: &str, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StoreError>,
    {
        Self::validate_name(name)?;
        let locks = &self.locks;
        let lease = locks.lease(name);
        let grant = &lease.grant;

        if locks.held_by_current_chain(name) {
            let depth = grant.depth.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(name, depth, "Re-entering held lock");
            let _depth = DepthGuard(grant);
            return work().await;
        }

        // If dropped early: depth, then sentinel, then the gate, then the lease.
        let _permit = Arc::clone(&grant.gate).lock_owned().await;
        let sentinel = locks.acquire_sentinel(&self.lock_path(name)).await?;
        grant.depth.store(1, Ordering::SeqCst);
        let depth = DepthGuard(grant);

        self.cache.invalidate(name);
        debug!(name, "Lock acquired");

        let mut held = HELD.try_with(Clone::clone).unwrap_or_default();
        held.insert(locks.key(name));
        let result = HELD.scope(held, async move { work().await }).await;

        drop(depth);
        sentinel.release().await;
        debug!(name, "Lock released");
        result
    }
}
