//! Cooperative cancellation signal shared by related tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// One-shot cancellation signal. Cloning shares the signal; once triggered
/// it stays triggered.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the token is triggered.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // notify_waiters only wakes already-registered waiters; register
        // before the flag check.
        notified.as_mut().enable();
        if self.triggered() {
            return;
        }
        notified.await;
    }

    /// Sleep that wakes early on cancellation. Returns `true` when the full
    /// duration elapsed, `false` when cancelled.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.triggered() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = &mut notified => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn sleep_runs_to_completion_without_trigger() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn trigger_interrupts_sleep() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.sleep(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = Instant::now();
        token.trigger();
        assert!(!handle.await.unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn trigger_before_wait_is_not_lost() {
        let token = CancelToken::new();
        token.trigger();
        assert!(!token.sleep(Duration::from_secs(30)).await);
        token.cancelled().await;
        assert!(token.triggered());
    }
}
