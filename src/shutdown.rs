//! Cancellation shared by the CLI, the scheduler and connector calls.
//!
//! One [`ShutdownCoordinator`] is created per process (or per test) and
//! threaded through every long wait: rate-limiter refills, retry backoff,
//! query polling and the scheduler's poll interval. Work in progress stops
//! at its next boundary once shutdown is requested; nothing is aborted
//! mid-write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Shared handle to a shutdown coordinator.
pub type SharedShutdown = Arc<ShutdownCoordinator>;

/// Process-wide cancellation flag with async wake-up.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    requested: AtomicBool,
    wake: Notify,
}

impl ShutdownCoordinator {
    /// Fresh coordinator with shutdown not requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh coordinator behind an [`Arc`].
    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Request shutdown; waiters are woken on the first call only.
    pub fn request_shutdown(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            self.wake.notify_waiters();
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown is requested.
    pub async fn wait_for_shutdown(&self) {
        // Register before checking the flag so a concurrent request is not missed.
        let notified = self.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Sleep for `duration` unless shutdown interrupts it.
    ///
    /// Returns `true` when the full duration elapsed and `false` when the
    /// sleep was cut short (or shutdown had already been requested).
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_shutdown_requested() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait_for_shutdown() => false,
        }
    }
}
