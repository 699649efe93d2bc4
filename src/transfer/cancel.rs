use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Cooperative cancellation for an in-flight transfer worker. Cancelling
/// wakes any pending inter-attempt sleep so the worker can release its
/// in-flight guard slot instead of wedging it.
#[derive(Clone, Default)]
pub struct CancelFlag {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first. Returns true when the
    /// sleep was cut short by cancellation.
    pub async fn sleep_unless_cancelled(&self, duration: Duration) -> bool {
        // Register for the notification before the flag check, so a cancel
        // landing in between cannot be missed.
        let mut notified = std::pin::pin!(self.inner.notify.notified());
        notified.as_mut().enable();
        if self.is_cancelled() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = notified => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_cancel() {
        let flag = CancelFlag::new();
        assert!(!flag.sleep_unless_cancelled(Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_cuts_sleep_short() {
        let flag = CancelFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move {
            waiter.sleep_unless_cancelled(Duration::from_secs(3600)).await
        });
        tokio::task::yield_now().await;
        flag.cancel();
        assert!(handle.await.unwrap());
        assert!(flag.is_cancelled());
    }
}
