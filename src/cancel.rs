//! Request cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A handle that cancels an in-flight request.
///
/// Cloning is cheap; all clones observe the same state. A canceled
/// request unblocks from whichever suspension point it is parked on
/// (acquire, dial, write, read) and fails with a canceled error.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    canceled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the token. Idempotent.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is tripped.
    pub(crate) async fn canceled(&self) {
        while !self.is_canceled() {
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                break;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_unparks_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.canceled().await });
        token.cancel();
        handle.await.unwrap();
        assert!(token.is_canceled());
    }

    #[tokio::test]
    async fn already_canceled_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        token.canceled().await;
    }
}
