//! In-flight work counter with an idle signal.
//!
//! Graceful shutdown waits on [`ActivityCounter::wait_idle`] instead of
//! polling the count.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Counts in-flight executions and wakes waiters when the count hits zero.
#[derive(Debug, Default)]
pub struct ActivityCounter {
    count: AtomicUsize,
    idle: Notify,
}

impl ActivityCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement, waking idle waiters when the count reaches zero.
    pub fn dec(&self) {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "activity counter underflow");
        if prev == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Current count.
    pub fn load(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Increment and return a guard that decrements on drop.
    pub fn enter(self: &Arc<Self>) -> ActivityGuard {
        self.inc();
        ActivityGuard {
            counter: Arc::clone(self),
        }
    }

    /// Resolve once the count is zero.
    pub async fn wait_idle(&self) {
        loop {
            // Registered before the check so a concurrent `dec` cannot slip
            // between the load and the await.
            let notified = self.idle.notified();
            if self.load() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements its counter when dropped.
#[derive(Debug)]
pub struct ActivityGuard {
    counter: Arc<ActivityCounter>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.counter.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_idle_when_empty() {
        let counter = ActivityCounter::new();
        tokio::time::timeout(Duration::from_millis(50), counter.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_after_guard_drop() {
        let counter = Arc::new(ActivityCounter::new());
        let guard = counter.enter();
        assert_eq!(counter.load(), 1);

        let waiter = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counter.load(), 0);
    }
}
