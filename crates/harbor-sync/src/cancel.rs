//! Cooperative cancellation for discovery and sync sessions.

use crate::discovery_logger::duration_ms;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Shared cancel flag, owned by the caller.
///
/// Sessions only poll it between chain-index queries. Once cancelled a token
/// stays cancelled; start the next session with a fresh one.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Token in the non-cancelled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Request cancellation and wake waiters
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Resolve once cancellation is requested
    pub async fn cancelled(&self) {
        // Register before checking the flag so a concurrent cancel is not missed.
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Cancel after `delay` unless cancelled earlier
    pub fn cancel_after(&self, delay: Duration) -> JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    tracing::debug!(
                        delay_ms = duration_ms(delay),
                        "Cancel deadline reached"
                    );
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fires() {
        let token = CancelToken::new();
        let timer = token.cancel_after(Duration::from_millis(250));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!token.is_cancelled());

        timer.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_stops_when_cancelled_early() {
        let token = CancelToken::new();
        let timer = token.cancel_after(Duration::from_secs(3600));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), timer)
            .await
            .unwrap()
            .unwrap();
    }
}
