use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Cooperative shutdown signal shared by every pair loop.
///
/// Flipped once by a termination signal or an explicit [`trigger`] call and
/// never reset. Loops consult it before fetching and while sleeping; an
/// in-flight persist is always allowed to finish.
///
/// [`trigger`]: ShutdownToken::trigger
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    stopped: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent; wakes every pending [`cancelled`] wait.
    ///
    /// [`cancelled`]: ShutdownToken::cancelled
    pub fn trigger(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown has been requested. Returns immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        while !self.is_triggered() {
            let notified = self.inner.notify.notified();
            // Re-check after registering so a trigger between the check and
            // the registration is not missed.
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}
