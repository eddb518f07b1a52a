//! The client side of one coordinator connection.
//!
//! A client cannot be trusted to say goodbye: its task may be aborted or
//! its process killed. Each client therefore holds a lock named
//! `tab-close-signal-<id>` for as long as it lives, and a watcher on the
//! coordinator side waits for the same lock. Getting it means the client is
//! gone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::{ClientProvider, SharedCoordinator, WrappedPort};
use crate::error::DbResult;
use crate::locks::{LockHold, LockOptions, LockService};
use crate::logging::LogLevel;
use crate::sync::{ConnectOptions, StreamSubscription, SyncParams};

pub struct TabClient {
    coordinator: Arc<SharedCoordinator>,
    port: Arc<WrappedPort>,
    liveness: Mutex<Option<LockHold>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TabClient {
    /// Registers a new client with `coordinator`. The liveness lock is held
    /// on `locks`, the client's own namespace; the watcher waits on the
    /// coordinator's. Both must reach the same lock (one registry, or one
    /// lock directory across processes).
    pub async fn attach(
        coordinator: Arc<SharedCoordinator>,
        provider: Arc<dyn ClientProvider>,
        locks: LockService,
    ) -> DbResult<Self> {
        let tab_id = Uuid::new_v4().to_string();
        let signal = format!("tab-close-signal-{tab_id}");
        let liveness = locks.hold(&signal, LockOptions::exclusive()).await?;
        let port = coordinator.add_port(tab_id, provider).await;

        let watcher = {
            let coordinator = coordinator.clone();
            let port = port.clone();
            let locks = coordinator.locks().clone();
            tokio::spawn(async move {
                match locks.hold(&signal, LockOptions::exclusive()).await {
                    Ok(released) => {
                        info!(tab = port.tab_id(), "client released its liveness lock; removing port");
                        coordinator.remove_port(&port).await;
                        drop(released);
                    }
                    Err(err) => warn!(tab = port.tab_id(), error = %err, "liveness watch failed"),
                }
            })
        };

        Ok(Self {
            coordinator,
            port,
            liveness: Mutex::new(Some(liveness)),
            watcher: Mutex::new(Some(watcher)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn tab_id(&self) -> &str {
        self.port.tab_id()
    }

    pub fn port(&self) -> &Arc<WrappedPort> {
        &self.port
    }

    pub async fn connect(&self, options: ConnectOptions) -> DbResult<()> {
        self.coordinator.connect(options).await
    }

    pub async fn disconnect(&self) -> DbResult<()> {
        self.coordinator.disconnect().await
    }

    pub fn trigger_crud_upload(&self) {
        self.coordinator.trigger_crud_upload();
    }

    /// Records this client's subscriptions, then configures the coordinator.
    pub async fn set_params(
        &self,
        params: SyncParams,
        subscriptions: Vec<StreamSubscription>,
    ) -> DbResult<()> {
        self.port.set_subscriptions(subscriptions);
        self.coordinator.set_params(params).await
    }

    pub async fn get_write_checkpoint(&self) -> DbResult<String> {
        self.coordinator.get_write_checkpoint().await
    }

    pub async fn has_completed_sync(&self) -> DbResult<bool> {
        self.coordinator.has_completed_sync().await
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.coordinator.set_log_level(level);
    }

    pub async fn update_subscriptions(&self, subscriptions: Vec<StreamSubscription>) {
        self.coordinator
            .update_subscriptions(&self.port, subscriptions)
            .await;
    }

    /// Manual close: the port is removed before this returns.
    pub async fn close(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.coordinator.remove_port(&self.port).await;
        self.liveness.lock().take();
        debug!(tab = self.port.tab_id(), "client close acknowledged");
        Ok(())
    }
}

impl std::fmt::Debug for TabClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabClient")
            .field("tab_id", &self.port.tab_id())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
