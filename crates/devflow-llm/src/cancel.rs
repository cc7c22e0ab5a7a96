//! Cooperative cancellation.
//!
//! One [`CancelSource`] per workflow; every provider call and backoff sleep
//! holds a [`CancelToken`] clone and unwinds at its next suspension point
//! once the source fires. Cancellation is level-triggered and one-way.

use tokio::sync::watch;

/// The cancelling side.
#[derive(Debug, Clone)]
pub struct CancelSource {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancelSource {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// A token observing this source.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Fire. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// The observing side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that can never fire; for tests and fire-and-forget calls.
    #[must_use]
    pub fn never() -> Self {
        CancelSource::new().token()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation fires. If the source is dropped without
    /// firing, this pends forever, which makes it safe to race in `select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
