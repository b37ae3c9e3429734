//! A small cancellation latch for SSE connection lifecycles.

use std::{sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

/// A clonable one-way cancellation signal.
///
/// Clones share the same state: once any of them fires
/// [`CancelToken::cancel`], every waiter wakes and the token stays
/// cancelled forever.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: Mutex<bool>,
    changed: Condvar,
}

impl CancelToken {
    /// A fresh, uncancelled token.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        if !*cancelled {
            *cancelled = true;
            self.inner.changed.notify_all();
        }
    }

    /// Whether the token has fired.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock()
    }

    /// Block until the token fires.
    pub fn wait(&self) {
        let mut cancelled = self.inner.cancelled.lock();
        while !*cancelled {
            self.inner.changed.wait(&mut cancelled);
        }
    }

    /// Block until the token fires or the timeout elapses. Returns whether
    /// the token fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut cancelled = self.inner.cancelled.lock();
        if !*cancelled {
            let _ = self.inner.changed.wait_for(&mut cancelled, timeout);
        }
        *cancelled
    }
}
