//! Session registry for one multiplexed connection.
//!
//! Tracks all live sessions by 16-bit ID, allocates IDs, and owns the token
//! scheduler task. Mutations take the registry's write lock; accessors and
//! scheduler scan passes take the read lock.

use crate::config::ManagerConfig;
use crate::scheduler::TokenScheduler;
use crate::session::Session;
use mux_core::{Handoff, Link, MuxResult, TransferType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Mutable registry state, guarded by one lock.
pub(crate) struct Registry {
    pub(crate) sessions: HashMap<u16, Arc<Session>>,
    /// Allocation counter. Wraps from 65535 to 0 with no collision check.
    count: u16,
    pub(crate) closed: bool,
}

/// The running scheduler task.
struct SchedulerTask {
    /// Taken by the first `close()` to join the task.
    handle: Option<JoinHandle<()>>,
    /// Lets every other `close()` wait for the task to end.
    stopped: watch::Receiver<bool>,
}

pub(crate) struct Inner {
    pub(crate) registry: RwLock<Registry>,
    /// Sessions announce demand here; closing it stops the scheduler.
    pub(crate) demand: Handoff<u16>,
    pub(crate) scan_passes: AtomicU64,
    scheduler: std::sync::Mutex<Option<SchedulerTask>>,
    pub(crate) config: ManagerConfig,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone without close(): let the scheduler task finish.
        self.demand.close();
    }
}

/// Point-in-time view of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    /// Live sessions.
    pub size: usize,
    /// Allocations so far (wrapping at 65536).
    pub count: usize,
    pub closed: bool,
    /// Completed scheduler scan passes.
    pub scan_passes: u64,
}

/// Owns every session of one multiplexed connection.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager with default configuration.
    ///
    /// Spawns the token scheduler, so this must run inside a Tokio runtime.
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    /// Create a manager and start its token scheduler.
    pub fn with_config(config: ManagerConfig) -> Self {
        let manager = Self::build(config);
        manager.start_scheduler();
        manager
    }

    fn build(config: ManagerConfig) -> Self {
        let registry = Registry {
            sessions: HashMap::with_capacity(config.initial_capacity),
            count: 0,
            closed: false,
        };
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(registry),
                demand: Handoff::new(),
                scan_passes: AtomicU64::new(0),
                scheduler: std::sync::Mutex::new(None),
                config,
            }),
        }
    }

    /// Manager whose scheduler is not running yet; tests start it by hand.
    #[cfg(test)]
    pub(crate) fn unscheduled(config: ManagerConfig) -> Self {
        Self::build(config)
    }

    pub(crate) fn start_scheduler(&self) {
        let (handle, stopped) = TokenScheduler::new(&self.inner).spawn();
        let mut slot = self
            .inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(SchedulerTask {
            handle: Some(handle),
            stopped,
        });
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Allocate a new session with the next ID.
    ///
    /// Returns `None` if the manager is closed.
    pub async fn allocate(&self, transfer_type: TransferType, link: Link) -> Option<Arc<Session>> {
        let mut registry = self.inner.registry.write().await;
        if registry.closed {
            return None;
        }

        registry.count = registry.count.wrapping_add(1);
        let id = registry.count;
        let session = Arc::new(Session::new(id, transfer_type, link).register(&self.inner));
        registry.sessions.insert(id, Arc::clone(&session));
        drop(registry);

        debug!(manager = %self.inner.config.label, session_id = id, %transfer_type, "session allocated");
        Some(session)
    }

    /// Register a caller-built session under its own ID.
    ///
    /// The caller is responsible for the ID being unique. Returns `None`, and
    /// registers nothing, if the manager is closed.
    pub async fn add(&self, session: Session) -> Option<Arc<Session>> {
        let mut registry = self.inner.registry.write().await;
        if registry.closed {
            return None;
        }

        // Only bookkeeping; the session keeps its own ID.
        registry.count = registry.count.wrapping_add(1);
        let session = Arc::new(session.register(&self.inner));
        let id = session.id();
        registry.sessions.insert(id, Arc::clone(&session));
        drop(registry);

        debug!(manager = %self.inner.config.label, session_id = id, "session added");
        Some(session)
    }

    /// Remove a session from the registry. Unknown IDs are ignored.
    pub async fn remove(&self, id: u16) {
        let mut registry = self.inner.registry.write().await;
        if registry.closed {
            return;
        }

        if registry.sessions.remove(&id).is_some() {
            debug!(manager = %self.inner.config.label, session_id = id, "session removed");
        }

        if registry.sessions.is_empty() {
            // Give back the storage of a formerly large registry.
            registry.sessions = HashMap::with_capacity(self.inner.config.initial_capacity);
        }
    }

    /// Look up a live session.
    pub async fn get(&self, id: u16) -> Option<Arc<Session>> {
        let registry = self.inner.registry.read().await;
        if registry.closed {
            return None;
        }
        registry.sessions.get(&id).cloned()
    }

    /// Number of live sessions.
    pub async fn size(&self) -> usize {
        self.inner.registry.read().await.sessions.len()
    }

    /// Number of allocations so far.
    pub async fn count(&self) -> usize {
        usize::from(self.inner.registry.read().await.count)
    }

    pub async fn closed(&self) -> bool {
        self.inner.registry.read().await.closed
    }

    /// Completed scheduler scan passes.
    pub fn scan_passes(&self) -> u64 {
        self.inner.scan_passes.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> ManagerStats {
        let registry = self.inner.registry.read().await;
        ManagerStats {
            size: registry.sessions.len(),
            count: usize::from(registry.count),
            closed: registry.closed,
            scan_passes: self.scan_passes(),
        }
    }

    /// Mark the manager closed if it holds no sessions.
    ///
    /// Returns `true` if the manager is (now) closed. With live sessions it
    /// returns `false` and changes nothing.
    pub async fn close_if_no_session(&self) -> bool {
        let mut registry = self.inner.registry.write().await;
        if registry.closed {
            return true;
        }
        if !registry.sessions.is_empty() {
            return false;
        }

        registry.closed = true;
        // Nothing left to schedule and nothing can be added.
        self.inner.demand.close();
        debug!(manager = %self.inner.config.label, "idle session manager closed");
        true
    }

    /// Close the manager, every live session's streams, and the scheduler.
    ///
    /// Idempotent. Sessions are not removed one by one through
    /// [`Session::close`]: that would re-enter this registry's write lock.
    pub async fn close(&self) -> MuxResult<()> {
        {
            let mut registry = self.inner.registry.write().await;
            if !registry.closed {
                registry.closed = true;
                self.inner.demand.close();

                for session in registry.sessions.values() {
                    session.close_streams().await;
                }
                let closed = registry.sessions.len();
                registry.sessions = HashMap::new();

                info!(manager = %self.inner.config.label, sessions = closed, "session manager closed");
            }
        }

        // The scheduler needs the read lock to observe the close, so join it
        // only after the write lock is released.
        self.join_scheduler().await;
        Ok(())
    }

    async fn join_scheduler(&self) {
        let (handle, mut stopped) = {
            let mut slot = self
                .inner
                .scheduler
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(task) = slot.as_mut() else {
                return;
            };
            (task.handle.take(), task.stopped.clone())
        };

        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!(manager = %self.inner.config.label, error = %e, "token scheduler task failed");
                }
            }
            // Another close() is joining; a dropped sender also means the task ended.
            None => {
                let _ = stopped.wait_for(|done| *done).await;
            }
        }
    }

    /// Whether the scheduler task has ended (or was never started).
    #[cfg(test)]
    pub(crate) fn scheduler_stopped(&self) -> bool {
        let slot = self
            .inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().map_or(true, |task| *task.stopped.borrow())
    }

    #[cfg(test)]
    async fn set_count(&self, count: u16) {
        self.inner.registry.write().await.count = count;
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("label", &self.inner.config.label)
            .field("scan_passes", &self.scan_passes())
            .finish()
    }
}
