//! Cancellation and start synchronization shared between channels.
//!
//! [`StopSignal`] is a broadcast flag: [`StopSignal::trigger`] stores `true`
//! with `Release` ordering and [`StopSignal::is_triggered`] loads with
//! `Acquire`, so a reader that observes `true` also observes every write made
//! before the trigger. Waiters parked in [`StopSignal::triggered`] are woken.
//!
//! [`SyncBarrier`] releases its waiters once exactly `n` of them have
//! arrived. Release of any waiter happens after the `n`th arrival.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Barrier, Notify};

#[derive(Debug, Default)]
struct StopInner {
    flag: AtomicBool,
    notify: Notify,
}

/// Shared, idempotent cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl StopSignal {
    /// Creates an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop. Calling it again has no further effect.
    pub fn trigger(&self) {
        if !self.inner.flag.swap(true, Ordering::Release) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Whether a stop was requested.
    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Resolves once a stop was requested.
    pub async fn triggered(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent trigger is not missed.
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Rendezvous for a fixed number of channels.
#[derive(Debug, Clone)]
pub struct SyncBarrier {
    barrier: Arc<Barrier>,
    parties: usize,
}

impl SyncBarrier {
    /// Barrier releasing once `parties` waiters arrived.
    pub fn new(parties: usize) -> Self {
        Self {
            barrier: Arc::new(Barrier::new(parties)),
            parties,
        }
    }

    /// Number of waiters the barrier expects.
    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Waits until every party arrived. Returns `true` for exactly one
    /// waiter per generation.
    pub async fn wait(&self) -> bool {
        self.barrier.wait().await.is_leader()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{timeout, Instant};

    #[tokio::test]
    async fn test_stop_signal_is_idempotent() {
        let signal = StopSignal::new();
        assert!(!signal.is_triggered());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_triggered());
        timeout(Duration::from_millis(50), signal.triggered())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_signal_wakes_waiters() {
        let signal = StopSignal::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.triggered().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();
        for waiter in waiters {
            timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_barrier_releases_after_last_arrival() {
        let barrier = SyncBarrier::new(3);
        let origin = Instant::now();
        let tasks: Vec<_> = [0u64, 40, 20]
            .into_iter()
            .map(|delay| {
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let leader = barrier.wait().await;
                    (leader, origin.elapsed())
                })
            })
            .collect();

        let mut leaders = 0;
        for task in tasks {
            let (leader, released) = task.await.unwrap();
            leaders += usize::from(leader);
            assert!(released >= Duration::from_millis(40));
        }
        assert_eq!(leaders, 1);
        assert_eq!(barrier.parties(), 3);
    }
}
