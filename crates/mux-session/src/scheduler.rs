//! Token scheduler: decides which waiting session may read next.
//!
//! The scheduler alternates between two states:
//!
//! - **Scanning**: under the registry read lock, offer a token to every
//!   session without blocking. Only sessions already parked in
//!   [`Session::read_multi_buffer`](crate::Session::read_multi_buffer) take
//!   it. If any did, scan again.
//! - **Idle**: nobody took a token; sleep until a session announces demand
//!   on the shared demand handoff.
//!
//! Closing the demand handoff (manager close, or the last manager handle
//! dropped) ends the task.

use crate::manager::Inner;
use mux_core::Handoff;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Value carried by a token. Sessions only care that one arrived.
const TOKEN: u16 = 233;

/// Scheduler state, reported in trace logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Scanning,
    Idle,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scanning => f.write_str("scanning"),
            Self::Idle => f.write_str("idle"),
        }
    }
}

pub(crate) struct TokenScheduler {
    registry: Weak<Inner>,
    demand: Handoff<u16>,
    label: String,
}

impl TokenScheduler {
    pub(crate) fn new(inner: &Arc<Inner>) -> Self {
        Self {
            registry: Arc::downgrade(inner),
            demand: inner.demand.clone(),
            label: inner.config.label.clone(),
        }
    }

    /// Start the task. The receiver turns `true` once the loop has ended.
    pub(crate) fn spawn(self) -> (JoinHandle<()>, watch::Receiver<bool>) {
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            self.run().await;
            stopped_tx.send_replace(true);
        });
        (handle, stopped_rx)
    }

    async fn run(self) {
        debug!(manager = %self.label, "token scheduler started");

        loop {
            // Register for demand before scanning: a session that misses
            // this pass can still wake us afterwards.
            let Some(demand) = self.demand.waiter() else {
                break;
            };

            let Some(hit) = self.scan().await else {
                break;
            };
            if hit {
                drop(demand);
                tokio::task::yield_now().await;
                continue;
            }

            trace!(manager = %self.label, state = %SchedulerState::Idle, "no session took a token");
            match demand.recv().await {
                Some(session_id) => {
                    trace!(manager = %self.label, session_id, state = %SchedulerState::Scanning, "demand signal");
                }
                None => break,
            }
        }

        debug!(manager = %self.label, "token scheduler stopped");
    }

    /// One scan pass. Returns whether any session took a token, or `None`
    /// once the registry is closed or gone.
    async fn scan(&self) -> Option<bool> {
        let inner = self.registry.upgrade()?;
        let registry = inner.registry.read().await;
        if registry.closed {
            return None;
        }

        let mut hit = false;
        for session in registry.sessions.values() {
            if session.offer_token(TOKEN) {
                hit = true;
            }
        }
        drop(registry);

        inner.scan_passes.fetch_add(1, Ordering::Relaxed);
        Some(hit)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ManagerConfig;
    use crate::testutil::{test_link, wait_until};
    use crate::SessionManager;
    use mux_core::{MultiBuffer, TransferType, Writer};
    use std::sync::Arc;
    use std::time::Duration;

    const READS_PER_SESSION: usize = 50;

    /// Upper bound on scan passes for `reads` completed reads.
    ///
    /// A pass that hands out tokens consumes at least one reader's token
    /// waiter. A pass that hands out none is the first pass, or follows a
    /// hit pass, or follows an idle wait ended by a reader's demand signal.
    /// Each read registers one token waiter and sends at most one demand
    /// signal.
    fn max_passes(reads: usize) -> u64 {
        3 * reads as u64 + 1
    }

    #[tokio::test]
    async fn demand_signal_wakes_idle_scheduler() {
        let manager = SessionManager::new();
        let demand = manager.inner().demand.clone();

        // First pass finds nothing and parks on the demand handoff.
        wait_until(|| manager.scan_passes() >= 1 && demand.has_waiter()).await;
        let before = manager.scan_passes();

        demand.try_offer(1).unwrap();
        wait_until(|| manager.scan_passes() > before).await;
    }

    #[tokio::test]
    async fn parked_reader_gets_token_on_next_scan() {
        let manager = SessionManager::unscheduled(ManagerConfig::default());
        let mut t = test_link();
        let session = manager
            .allocate(TransferType::Stream, t.link)
            .await
            .unwrap();
        t.feed
            .write_multi_buffer(MultiBuffer::from_bytes(b"ready"))
            .await
            .unwrap();

        // No scheduler yet: the demand offer finds nobody and the read parks.
        let reader = Arc::clone(&session);
        let read = tokio::spawn(async move { reader.read_multi_buffer().await });
        wait_until(|| session.is_waiting()).await;
        assert!(!read.is_finished());

        let before = manager.scan_passes();
        manager.start_scheduler();
        let mb = tokio::time::timeout(Duration::from_secs(5), read)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(mb.into_bytes(), b"ready");

        // The first pass hands the token over; the second finds nobody
        // waiting and the scheduler goes idle.
        wait_until(|| manager.scan_passes() >= before + 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.scan_passes(), before + 2);
    }

    #[tokio::test]
    async fn concurrent_readers_all_progress() {
        let manager = SessionManager::new();
        let mut tasks = Vec::new();
        let mut feeds = Vec::new();

        for _ in 0..2 {
            let mut t = test_link();
            for i in 0..READS_PER_SESSION {
                t.feed
                    .write_multi_buffer(MultiBuffer::from_bytes(&[i as u8]))
                    .await
                    .unwrap();
            }
            let session = manager
                .allocate(TransferType::Stream, t.link)
                .await
                .unwrap();
            feeds.push(t.feed);

            tasks.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..READS_PER_SESSION {
                    got.extend(session.read_multi_buffer().await.unwrap().into_bytes());
                }
                got
            }));
        }

        for task in tasks {
            let got = tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("reader starved")
                .unwrap();
            let expected: Vec<u8> = (0..READS_PER_SESSION).map(|i| i as u8).collect();
            assert_eq!(got, expected);
        }
        manager.close().await.unwrap();
        assert!(manager.scan_passes() <= max_passes(2 * READS_PER_SESSION));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn many_readers_on_worker_threads() {
        let manager = SessionManager::new();
        let mut tasks = Vec::new();
        let mut feeds = Vec::new();

        for _ in 0..8 {
            let mut t = test_link();
            for _ in 0..READS_PER_SESSION {
                t.feed
                    .write_multi_buffer(MultiBuffer::from_bytes(b"x"))
                    .await
                    .unwrap();
            }
            let session = manager
                .allocate(TransferType::Packet, t.link)
                .await
                .unwrap();
            feeds.push(t.feed);

            tasks.push(tokio::spawn(async move {
                for _ in 0..READS_PER_SESSION {
                    session.read_multi_buffer().await.unwrap();
                }
            }));
        }

        for task in tasks {
            tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("reader starved")
                .unwrap();
        }
        manager.close().await.unwrap();
        assert!(manager.scan_passes() <= max_passes(8 * READS_PER_SESSION));
    }

    #[tokio::test]
    async fn scheduler_exits_on_close() {
        let manager = SessionManager::new();
        wait_until(|| manager.inner().demand.has_waiter()).await;
        tokio::time::timeout(Duration::from_secs(5), manager.close())
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
