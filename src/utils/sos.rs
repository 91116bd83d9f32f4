//! Signal-of-Stop: cooperative cancellation shared by the session loop and
//! the binary's front-end tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Cancellation token. Clones share state, so cancelling any clone wakes
/// every waiter.
#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    internal: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.internal.closing.store(true, Ordering::Release);
        self.internal.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.internal.closing.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
    pub async fn wait(&self) {
        loop {
            let notified = self.internal.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a cancel in between is not lost.
            notified.as_mut().enable();
            if self.cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_after_cancel() {
        let sos = SignalOfStop::new();
        let waiter = tokio::spawn({
            let sos = sos.clone();
            async move { sos.wait().await }
        });
        tokio::task::yield_now().await;
        assert!(!sos.cancelled());

        sos.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn already_cancelled_returns_immediately() {
        let sos = SignalOfStop::new();
        sos.cancel();
        sos.wait().await;
        assert!(sos.clone().cancelled());
    }
}
