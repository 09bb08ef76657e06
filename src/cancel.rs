//! Cancellation tokens for long-running operations.
//!
//! Every connect, scan and stream-start operation hands back a
//! [`CancelToken`]. Cancellation is idempotent and flows parent → child only:
//! cancelling a session's token cancels every subscription token derived from
//! it via [`CancelToken::child`], while cancelling a subscription token never
//! touches the session.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
        let children = std::mem::take(&mut *self.children.lock().unwrap());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// A clonable cancellation handle. All clones observe the same flag.
#[derive(Clone)]
pub struct CancelToken(Arc<Inner>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(Inner {
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
            children: Mutex::new(Vec::new()),
        }))
    }

    /// Derive a child token. Cancelling `self` cancels the child; cancelling
    /// the child leaves `self` untouched. A child derived from an
    /// already-cancelled token is born cancelled.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        self.adopt(&child);
        child
    }

    /// Register an existing token as a child of `self`, so cancelling `self`
    /// cascades into it. Used to tie a connect attempt spawned by
    /// auto-connect to the search's own token.
    pub(crate) fn adopt(&self, child: &CancelToken) {
        {
            let mut children = self.0.children.lock().unwrap();
            // Check under the lock so a concurrent cancel() cannot miss us.
            if !self.0.cancelled.load(Ordering::SeqCst) {
                children.retain(|w| w.strong_count() > 0);
                children.push(Arc::downgrade(&child.0));
                return;
            }
        }
        child.cancel();
    }

    /// Flip the token. Safe to call any number of times from any task.
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled. Immediately ready if it already
    /// is.
    pub async fn cancelled(&self) {
        loop {
            let mut notified = pin!(self.0.notify.notified());
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        // Already-cancelled tokens resolve immediately.
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("cancelled() should be ready");
    }

    #[tokio::test]
    async fn test_parent_cancels_children() {
        let parent = CancelToken::new();
        let child_a = parent.child();
        let child_b = parent.child();
        parent.cancel();
        assert!(child_a.is_cancelled());
        assert!(child_b.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent_alone() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_of_cancelled_parent_is_born_cancelled() {
        let parent = CancelToken::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
