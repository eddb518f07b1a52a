//! Registries of callbacks with disposable registrations.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::error;

/// An ordered set of listeners. Dispatch works on a snapshot, so a callback may
/// register or dispose listeners without deadlocking.
pub struct ListenerSet<L: ?Sized> {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Arc<L>>>,
}

impl<L: ?Sized + Send + Sync + 'static> ListenerSet<L> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn register(self: &Arc<Self>, listener: Arc<L>) -> ListenerGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, listener);
        let set: Weak<Self> = Arc::downgrade(self);
        ListenerGuard::new(move || {
            if let Some(set) = set.upgrade() {
                set.listeners.lock().remove(&id);
            }
        })
    }

    /// Invokes `f` for every listener. A panicking listener is logged and does
    /// not stop delivery to the others.
    pub fn iterate(&self, mut f: impl FnMut(&L)) {
        let snapshot: Vec<Arc<L>> = self.listeners.lock().values().cloned().collect();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| f(&listener))).is_err() {
                error!("listener panicked during dispatch");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.listeners.lock().clear();
    }
}

/// Disposes its registration when dropped.
#[must_use = "dropping the guard unregisters the listener"]
pub struct ListenerGuard {
    dispose: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerGuard {
    pub fn new(dispose: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// A guard with nothing to dispose.
    pub fn noop() -> Self {
        Self { dispose: None }
    }

    pub fn dispose(mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}
