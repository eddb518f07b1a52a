//! Cooperative cancellation for lock waits and remote calls.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{DbError, DbResult};

/// A cloneable abort signal. Cancelling any clone cancels them all, and every
/// token derived through [`CancelToken::child`].
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl CancelState {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_waiters();
        let children = std::mem::take(&mut *self.children.lock());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelState {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A token cancelled together with `self` that can also be cancelled on
    /// its own without affecting the parent.
    pub fn child(&self) -> Self {
        let child = Self::new();
        {
            let mut children = self.inner.children.lock();
            if !self.is_cancelled() {
                children.retain(|weak| weak.strong_count() > 0);
                children.push(Arc::downgrade(&child.inner));
                return child;
            }
        }
        child.cancel();
        child
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
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

/// Runs `fut` unless `token` fires first, in which case the future is dropped
/// and `DbError::Cancelled` is returned.
pub async fn with_abort<T, F>(token: &CancelToken, fut: F) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DbError::Cancelled),
        result = fut => result,
    }
}

/// [`with_abort`] with an additional fail-safe timer.
pub async fn with_abort_timeout<T, F>(
    token: &CancelToken,
    limit: Duration,
    what: &str,
    fut: F,
) -> DbResult<T>
where
    F: Future<Output = DbResult<T>>,
{
    match tokio::time::timeout(limit, with_abort(token, fut)).await {
        Ok(result) => result,
        Err(_) => Err(DbError::Timeout(format!("{what} after {}ms", limit.as_millis()))),
    }
}
