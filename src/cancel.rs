//! Hierarchical cooperative cancellation
//!
//! Every long-lived loop owns a child token; cancelling a parent cancels the
//! whole subtree, so shutting down a worker tears down its subscriptions and
//! their in-flight tasks deterministically.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// A token for cooperative task cancellation
///
/// Clones share state: cancelling any clone cancels them all, and cancelling
/// a parent eagerly cancels every child created from it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<CancelToken>>,
}

impl CancelToken {
    /// Create a root token
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a child cancelled together with this token
    pub fn child(&self) -> Self {
        let child = CancelToken::new();
        if self.is_cancelled() {
            child.cancel();
        } else {
            self.inner.children.lock().push(child.clone());
        }
        child
    }

    /// Cancel this token and its whole subtree
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.notify.notify_waiters();
        let children = std::mem::take(&mut *self.inner.children.lock());
        for child in children {
            child.cancel();
        }
    }

    /// Whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait for cancellation; returns immediately if already cancelled
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
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

/// RAII scope: cancels its token when dropped unless disarmed
pub struct CancelGuard {
    token: CancelToken,
    armed: bool,
}

impl CancelGuard {
    /// Guard an existing token
    pub fn new(token: CancelToken) -> Self {
        Self { token, armed: true }
    }

    /// The guarded token
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Keep the token alive past this scope
    pub fn disarm(mut self) -> CancelToken {
        self.armed = false;
        self.token.clone()
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if self.armed {
            self.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_cancel_is_visible() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancels_child() {
        let parent = CancelToken::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = CancelToken::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waiter.cancel();
        });
        timeout(Duration::from_millis(500), token.cancelled())
            .await
            .expect("waiter must wake");
    }

    #[tokio::test]
    async fn test_guard_cancels_on_drop() {
        let token = {
            let guard = CancelGuard::new(CancelToken::new());
            guard.token().clone()
        };
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_disarmed_guard_leaves_token_live() {
        let token = {
            let guard = CancelGuard::new(CancelToken::new());
            guard.disarm()
        };
        assert!(!token.is_cancelled());
    }
}
