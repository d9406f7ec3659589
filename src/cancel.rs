//! Process-Wide Cancellation
//!
//! A single `Cancel` token is created at startup and handed to every
//! long-running component: the auditor loop, the sample-set builder, each
//! random walk, and the snapshot decoder. The token is set exactly once
//! (SIGTERM, or a fatal error path in the CLI) and every observer sees it
//! from then on. Observers either poll `is_cancelled` at loop boundaries or
//! await `cancelled` inside a `select!`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// One-shot broadcast cancellation signal.
///
/// Clones share the same underlying flag; cancelling any clone cancels all
/// of them. `cancel` is idempotent.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Cancel {
    pub fn new() -> Self {
        Cancel::default()
    }

    /// Set the signal. All current and future observers see it.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Cheap poll, suitable for every loop iteration and recursion entry.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the signal is set. Resolves immediately if it already
    /// is.
    pub async fn cancelled(&self) {
        // Register interest before re-checking the flag so a cancel between
        // the check and the await is not missed.
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
