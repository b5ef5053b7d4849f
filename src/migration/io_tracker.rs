//! In-flight IO accounting for executors and clients.
//!
//! Teardown closes the tracker, then waits until every outstanding guard is
//! dropped. New IO is refused once the tracker is closed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Counts IO operations started by a migration task.
#[derive(Debug, Default)]
pub struct IoTracker {
    in_flight: AtomicU64,
    closed: AtomicBool,
    drained: Notify,
}

impl IoTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one IO. Returns `None` once the tracker is closed.
    pub fn start(self: &Arc<Self>) -> Option<IoGuard> {
        // Pairs with `drain`: either drain sees this IO counted or this IO
        // sees the tracker closed.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            self.finish();
            return None;
        }
        Some(IoGuard {
            tracker: Arc::clone(self),
        })
    }

    /// Number of IOs still running.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse new IO and wait for outstanding IO to finish.
    pub async fn drain(&self) {
        self.closed.store(true, Ordering::SeqCst);
        loop {
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Keeps one IO registered until dropped.
#[derive(Debug)]
pub struct IoGuard {
    tracker: Arc<IoTracker>,
}

impl Drop for IoGuard {
    fn drop(&mut self) {
        self.tracker.finish();
    }
}
