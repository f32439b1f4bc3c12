//! Demand tracking for tasks that live only while they have work.
//!
//! A demand-based task counts requests in flight and remembers when it last
//! saw activity. [`DemandTracker::idle_expired`] resolves once the idle window
//! has passed with nothing in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default idle window for demand-based tasks
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Pending-work counter with an idle timer
#[derive(Debug)]
pub struct DemandTracker {
    idle: Duration,
    pending: AtomicU64,
    last_active: Mutex<Instant>,
    drained: Notify,
}

impl DemandTracker {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            pending: AtomicU64::new(0),
            last_active: Mutex::new(Instant::now()),
            drained: Notify::new(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle
    }

    /// A request was accepted; resets the idle timer.
    pub fn inc(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.touch();
    }

    /// A request resolved. Returns the number still pending.
    pub fn dec(&self) -> u64 {
        let prev = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        self.touch();
        let left = prev.saturating_sub(1);
        if left == 0 {
            self.drained.notify_one();
        }
        left
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// When the task would go idle, or `None` while work is in flight.
    pub fn idle_deadline(&self) -> Option<Instant> {
        if self.pending() > 0 {
            return None;
        }
        Some(*self.last_active.lock() + self.idle)
    }

    /// Resolve once nothing has been in flight for the whole idle window.
    ///
    /// Cancel-safe: all state lives in the tracker, so the future can be
    /// recreated on every turn of a `select!` loop.
    pub async fn idle_expired(&self) {
        loop {
            if self.pending() > 0 {
                self.drained.notified().await;
                continue;
            }
            let deadline = *self.last_active.lock() + self.idle;
            if Instant::now() >= deadline {
                if self.pending() == 0 {
                    return;
                }
                continue;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

impl Default for DemandTracker {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_dec() {
        let demand = DemandTracker::new(Duration::from_secs(1));
        demand.inc();
        demand.inc();
        assert_eq!(demand.pending(), 2);
        assert!(demand.idle_deadline().is_none());

        assert_eq!(demand.dec(), 1);
        assert_eq!(demand.dec(), 0);
        assert_eq!(demand.dec(), 0);
        assert!(demand.idle_deadline().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expires_without_work() {
        let demand = DemandTracker::new(Duration::from_millis(100));
        let start = Instant::now();
        demand.idle_expired().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_work_blocks_idle() {
        let demand = DemandTracker::new(Duration::from_millis(50));
        demand.inc();

        let expired =
            tokio::time::timeout(Duration::from_millis(500), demand.idle_expired()).await;
        assert!(expired.is_err(), "must not go idle with a request in flight");

        demand.dec();
        let start = Instant::now();
        demand.idle_expired().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_timer() {
        let demand = DemandTracker::new(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(80)).await;
        demand.touch();

        let start = Instant::now();
        demand.idle_expired().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
