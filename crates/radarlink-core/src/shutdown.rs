//! Cooperative shutdown flag.
//!
//! A [`Shutdown`] handle is cheap to clone and may be triggered from any task
//! or thread, including a signal listener. Once requested it stays requested.
//! Every wait point in the session loop goes through [`Shutdown::sleep`] or
//! [`Shutdown::wait`], so a request is observed immediately rather than at the
//! end of the current delay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

/// Process-wide stop request.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    /// Create a handle with no stop requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop.
    ///
    /// Returns `true` for the call that actually set the flag; later calls are
    /// no-ops and return `false`.
    pub fn request(&self) -> bool {
        let first = !self.inner.requested.swap(true, Ordering::SeqCst);
        if first {
            debug!("Shutdown requested");
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// Whether a stop has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolve once a stop has been requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent request is not missed.
            notified.as_mut().enable();

            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless a stop is requested first.
    ///
    /// Returns `true` if the sleep ended because of a stop request.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.wait() => true,
            () = tokio::time::sleep(duration) => self.is_requested(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_idempotent() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_requested());

        assert!(shutdown.request());
        assert!(!shutdown.request());
        assert!(!shutdown.request());
        assert!(shutdown.is_requested());
    }

    #[test]
    fn test_clones_share_the_flag() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        clone.request();
        assert!(shutdown.is_requested());
    }

    #[tokio::test]
    async fn test_sleep_is_interrupted_by_request() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.request();
        });

        let started = std::time::Instant::now();
        let interrupted = shutdown.sleep(Duration::from_secs(30)).await;
        assert!(interrupted);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_sleep_completes_without_request() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.sleep(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn test_wait_returns_when_already_requested() {
        let shutdown = Shutdown::new();
        shutdown.request();
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait())
            .await
            .unwrap();
    }

    #[test]
    fn test_request_from_another_thread() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        std::thread::spawn(move || trigger.request()).join().unwrap();
        assert!(shutdown.is_requested());
    }
}
