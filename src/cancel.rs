//! A minimal cancellation token built on `tokio::sync::watch`.
//!
//! The teacher repo threads `tokio::sync` primitives everywhere rather than
//! reaching for an extra crate; a broadcast-style watch channel gives the
//! same "cancel once, observed everywhere" semantics `CancellationToken`
//! would, without adding a dependency the rest of the stack doesn't use.

use tokio::sync::watch;

#[derive(Clone)]
pub struct CancellationToken {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel()` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling; treat as cancelled so
                // waiters don't block forever on a token nobody owns anymore.
                return;
            }
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
