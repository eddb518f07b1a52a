//! One database connection and one sync session shared by many clients.
//!
//! Each client (a "tab") registers a port. Credential and upload requests
//! from the session are relayed to the most recent client.

pub mod client;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::adapter::{AdapterEvent, LockedAdapter};
use crate::cancel::{CancelToken, with_abort, with_abort_timeout};
use crate::config::{AdapterConfig, CoordinatorConfig, LocalSyncConfig};
use crate::connection::{Connection, DirectOptions, ProxiedConnection, ProxyOptions, SharedConnectionEndpoint};
use crate::error::{DbError, DbResult};
use crate::listeners::ListenerGuard;
use crate::locks::{LockScope, LockService};
use crate::logging::{LogControl, LogLevel};
use crate::sync::{
    ConnectOptions, Credentials, RemoteConnector, StatusSink, StreamSubscription, SyncContext,
    SyncParams, SyncSession, SyncSessionFactory, SyncStatus,
};

pub use client::TabClient;

/// What the coordinator can ask of a connected client.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn fetch_credentials(&self) -> DbResult<Option<Credentials>>;

    async fn invalidate_credentials(&self) -> DbResult<()>;

    async fn upload_crud(&self) -> DbResult<()>;

    /// A channel to the database connection hosted by this client.
    async fn get_db_worker_port(&self) -> DbResult<SharedConnectionEndpoint>;

    fn status_changed(&self, status: &SyncStatus);

    /// Receives coordinator log lines when log broadcasting is enabled.
    fn log(&self, _level: LogLevel, _message: &str) {}
}

pub type CloseListener = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// The coordinator's record of one connected client.
pub struct WrappedPort {
    id: u64,
    tab_id: String,
    provider: Arc<dyn ClientProvider>,
    subscriptions: Mutex<Vec<StreamSubscription>>,
    close_listeners: Mutex<Vec<(u64, CloseListener)>>,
    next_listener: AtomicU64,
    is_closing: AtomicBool,
}

impl WrappedPort {
    fn new(id: u64, tab_id: String, provider: Arc<dyn ClientProvider>) -> Self {
        Self {
            id,
            tab_id,
            provider,
            subscriptions: Mutex::new(Vec::new()),
            close_listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            is_closing: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn provider(&self) -> &Arc<dyn ClientProvider> {
        &self.provider
    }

    pub fn is_closing(&self) -> bool {
        self.is_closing.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<StreamSubscription> {
        self.subscriptions.lock().clone()
    }

    pub(crate) fn set_subscriptions(&self, subscriptions: Vec<StreamSubscription>) {
        *self.subscriptions.lock() = subscriptions;
    }

    pub fn add_close_listener(&self, listener: CloseListener) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.close_listeners.lock().push((id, listener));
        id
    }

    pub fn remove_close_listener(&self, id: u64) {
        self.close_listeners.lock().retain(|(listener_id, _)| *listener_id != id);
    }

    fn take_close_listeners(&self) -> Vec<CloseListener> {
        self.close_listeners
            .lock()
            .drain(..)
            .map(|(_, listener)| listener)
            .collect()
    }
}

impl std::fmt::Debug for WrappedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedPort")
            .field("id", &self.id)
            .field("tab_id", &self.tab_id)
            .field("is_closing", &self.is_closing())
            .finish()
    }
}

/// A relayed call in flight and the port serving it.
struct RelayController {
    token: CancelToken,
    port_id: u64,
}

struct RelaySlot<'a> {
    slot: &'a Mutex<Option<RelayController>>,
    token: CancelToken,
}

impl<'a> RelaySlot<'a> {
    fn install(slot: &'a Mutex<Option<RelayController>>, port_id: u64) -> Self {
        let token = CancelToken::new();
        let previous = slot.lock().replace(RelayController {
            token: token.clone(),
            port_id,
        });
        if previous.is_some() {
            debug!(port = port_id, "replacing an outstanding relay call");
        }
        Self { slot, token }
    }
}

impl Drop for RelaySlot<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot
            .as_ref()
            .is_some_and(|current| current.token.same_as(&self.token))
        {
            slot.take();
        }
    }
}

pub struct SharedCoordinator {
    self_ref: Weak<SharedCoordinator>,
    config: CoordinatorConfig,
    adapter_config: AdapterConfig,
    locks: LockService,
    factory: Arc<dyn SyncSessionFactory>,
    log: LogControl,
    ports: Mutex<Vec<Arc<WrappedPort>>>,
    port_mutex: tokio::sync::Mutex<()>,
    next_port: AtomicU64,
    params: Mutex<Option<SyncParams>>,
    params_gate: tokio::sync::Mutex<()>,
    adapter: Mutex<Option<Arc<LockedAdapter>>>,
    adapter_events: Mutex<Option<ListenerGuard>>,
    db_owner: Mutex<Option<u64>>,
    initialized: watch::Sender<bool>,
    session: Mutex<Option<Arc<dyn SyncSession>>>,
    session_gate: tokio::sync::Mutex<()>,
    last_connect: Mutex<Option<ConnectOptions>>,
    subscriptions: Mutex<Vec<StreamSubscription>>,
    status: Mutex<SyncStatus>,
    credentials_relay: Mutex<Option<RelayController>>,
    upload_relay: Mutex<Option<RelayController>>,
    broadcast_logs: AtomicBool,
    disposed: AtomicBool,
}

impl SharedCoordinator {
    /// Fails when clients from other processes would be coordinated through
    /// an in-process lock namespace, unless the configuration accepts that.
    pub fn new(
        config: &LocalSyncConfig,
        locks: LockService,
        factory: Arc<dyn SyncSessionFactory>,
        log: LogControl,
    ) -> DbResult<Arc<Self>> {
        let coordinator = &config.coordinator;
        if coordinator.cross_process_clients && locks.scope() == LockScope::Process {
            if !coordinator.allow_process_scope_locks {
                return Err(DbError::Config(
                    "clients in other processes need cross-process locks; configure a lock \
                     directory or set allow_process_scope_locks"
                        .to_string(),
                ));
            }
            warn!("coordinating cross-process clients with in-process locks; exclusion only holds within this process");
        }
        let (initialized, _) = watch::channel(false);
        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config: coordinator.clone(),
            adapter_config: config.adapter.clone(),
            locks,
            factory,
            log,
            ports: Mutex::new(Vec::new()),
            port_mutex: tokio::sync::Mutex::new(()),
            next_port: AtomicU64::new(1),
            params: Mutex::new(None),
            params_gate: tokio::sync::Mutex::new(()),
            adapter: Mutex::new(None),
            adapter_events: Mutex::new(None),
            db_owner: Mutex::new(None),
            initialized,
            session: Mutex::new(None),
            session_gate: tokio::sync::Mutex::new(()),
            last_connect: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
            status: Mutex::new(SyncStatus::default()),
            credentials_relay: Mutex::new(None),
            upload_relay: Mutex::new(None),
            broadcast_logs: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }))
    }

    pub fn from_config(
        config: &LocalSyncConfig,
        factory: Arc<dyn SyncSessionFactory>,
        log: LogControl,
    ) -> DbResult<Arc<Self>> {
        Self::new(config, LockService::from_config(config), factory, log)
    }

    pub fn locks(&self) -> &LockService {
        &self.locks
    }

    pub fn adapter(&self) -> Option<Arc<LockedAdapter>> {
        self.adapter.lock().clone()
    }

    pub fn port_count(&self) -> usize {
        self.ports.lock().len()
    }

    /// The port whose client hosts the current database channel.
    pub fn db_owner(&self) -> Option<u64> {
        *self.db_owner.lock()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<StreamSubscription> {
        self.subscriptions.lock().clone()
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    pub fn log_level(&self) -> LogLevel {
        self.log.level()
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.log.set_level(level);
        self.note(LogLevel::Info, format!("log level set to {level}"));
    }

    /// Logs locally and, with broadcasting enabled, on every client.
    fn note(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Trace => trace!("{message}"),
            LogLevel::Debug => debug!("{message}"),
            LogLevel::Info => info!("{message}"),
            LogLevel::Warn => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
            LogLevel::Off => return,
        }
        if !self.broadcast_logs.load(Ordering::SeqCst) || level < self.log.level() {
            return;
        }
        let ports = self.ports.lock().clone();
        for port in ports {
            port.provider.log(level, &message);
        }
    }

    fn last_port(&self) -> Option<Arc<WrappedPort>> {
        self.ports
            .lock()
            .iter()
            .rev()
            .find(|port| !port.is_closing())
            .cloned()
    }

    pub async fn add_port(
        &self,
        tab_id: impl Into<String>,
        provider: Arc<dyn ClientProvider>,
    ) -> Arc<WrappedPort> {
        let _ports = self.port_mutex.lock().await;
        let id = self.next_port.fetch_add(1, Ordering::Relaxed);
        let port = Arc::new(WrappedPort::new(id, tab_id.into(), provider));
        self.ports.lock().push(port.clone());
        if self.session.lock().is_some() {
            let status = self.status();
            port.provider.status_changed(&status);
        }
        self.note(LogLevel::Debug, format!("client port {id} ({}) added", port.tab_id));
        port
    }

    /// Unregisters `port`. Removing a port twice is a logged no-op.
    pub async fn remove_port(&self, port: &Arc<WrappedPort>) {
        port.is_closing.store(true, Ordering::SeqCst);
        let ports_guard = self.port_mutex.lock().await;
        let removed = {
            let mut ports = self.ports.lock();
            ports
                .iter()
                .position(|candidate| Arc::ptr_eq(candidate, port))
                .map(|index| ports.remove(index))
        };
        let Some(port) = removed else {
            warn!(port = port.id, "could not remove port since it is not among the active ports");
            return;
        };

        for relay in [&self.credentials_relay, &self.upload_relay] {
            if let Some(controller) = relay.lock().as_ref() {
                if controller.port_id == port.id {
                    controller.token.cancel();
                }
            }
        }

        for listener in port.take_close_listeners() {
            if AssertUnwindSafe(listener()).catch_unwind().await.is_err() {
                error!(port = port.id, "port close listener panicked");
            }
        }
        self.collect_subscriptions();
        let owned_db = {
            let mut owner = self.db_owner.lock();
            if *owner == Some(port.id) {
                owner.take();
                true
            } else {
                false
            }
        };
        drop(ports_guard);
        self.note(LogLevel::Debug, format!("client port {} removed", port.id));
        if owned_db {
            self.on_db_owner_removed().await;
        }
    }

    async fn on_db_owner_removed(&self) {
        self.note(
            LogLevel::Info,
            "database channel owner left; disconnecting sync".to_string(),
        );
        let session = self.session.lock().clone();
        if let Some(session) = &session {
            if let Err(err) = session.disconnect().await {
                warn!(error = %err, "sync disconnect failed");
            }
        }
        if self.port_count() == 0 || self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let Some(adapter) = self.adapter() else {
            return;
        };
        let reopen = adapter.reopen_internal_db();
        let options = self.last_connect.lock().clone();
        tokio::spawn(async move {
            if let Err(err) = reopen.await {
                warn!(error = %err, "re-open through a remaining client failed");
                return;
            }
            if let (Some(session), Some(options)) = (session, options) {
                if let Err(err) = session.connect(options).await {
                    warn!(error = %err, "sync reconnect failed");
                }
            }
        });
    }

    fn collect_subscriptions(&self) {
        let mut unique = BTreeMap::new();
        for port in self.ports.lock().iter() {
            for subscription in port.subscriptions.lock().iter() {
                unique.insert(subscription.key(), subscription.clone());
            }
        }
        let collected: Vec<StreamSubscription> = unique.into_values().collect();
        debug!(count = collected.len(), "collected stream subscriptions");
        *self.subscriptions.lock() = collected.clone();
        let session = self.session.lock().clone();
        if let Some(session) = session {
            session.update_subscriptions(&collected);
        }
    }

    pub async fn update_subscriptions(
        &self,
        port: &Arc<WrappedPort>,
        subscriptions: Vec<StreamSubscription>,
    ) {
        let _ports = self.port_mutex.lock().await;
        port.set_subscriptions(subscriptions);
        self.collect_subscriptions();
    }

    /// The first call fixes the parameters and opens the database; later
    /// calls only make sure a database channel exists.
    pub async fn set_params(&self, params: SyncParams) -> DbResult<()> {
        {
            let _ports = self.port_mutex.lock().await;
            self.collect_subscriptions();
        }
        let _gate = self.params_gate.lock().await;
        if self.params.lock().is_some() {
            return self.ensure_db().await;
        }
        *self.params.lock() = Some(params.clone());
        if params.stream_options.broadcast_logs {
            self.broadcast_logs.store(true, Ordering::SeqCst);
        }

        let adapter = self.build_adapter(&params);
        *self.adapter.lock() = Some(adapter.clone());
        adapter.init().await?;

        let weak = self.self_ref.clone();
        let events = adapter.register_listener(Arc::new(move |event: &AdapterEvent| {
            if *event != AdapterEvent::DatabaseReopened {
                return;
            }
            // Table updates may have been missed while the database was away.
            if let Some(coordinator) = weak.upgrade() {
                let session = coordinator.session.lock().clone();
                if let Some(session) = session {
                    session.trigger_crud_upload();
                }
            }
        }));
        *self.adapter_events.lock() = Some(events);
        self.initialized.send_replace(true);
        self.note(
            LogLevel::Info,
            format!("coordinator initialized for {}", params.identifier()),
        );
        Ok(())
    }

    async fn ensure_db(&self) -> DbResult<()> {
        let Some(adapter) = self.adapter() else {
            return Ok(());
        };
        adapter.init().await?;
        if self.db_owner().is_none() {
            adapter.reopen_internal_db().await?;
        }
        Ok(())
    }

    fn build_adapter(&self, params: &SyncParams) -> Arc<LockedAdapter> {
        let mut options = self.adapter_config.options(params.identifier());
        options.reopen_on_connection_closed = true;
        let weak = self.self_ref.clone();
        let db = params.db.clone();
        LockedAdapter::new(options, self.locks.clone(), move || {
            let weak = weak.clone();
            let db = db.clone();
            async move {
                let coordinator = weak.upgrade().ok_or(DbError::Closed)?;
                coordinator.open_internal_db(&db).await
            }
        })
    }

    /// Borrows a database channel from the most recent client, retrying
    /// while clients remain.
    async fn open_internal_db(&self, db: &DirectOptions) -> DbResult<Connection> {
        loop {
            if self.disposed.load(Ordering::SeqCst) {
                return Err(DbError::Closed);
            }
            let Some(port) = self.last_port() else {
                return Err(DbError::NoClient("a database connection".to_string()));
            };
            match self.open_via_port(&port, db).await {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    self.note(
                        LogLevel::Warn,
                        format!("error opening database through client port {}: {err}", port.id),
                    );
                    tokio::time::sleep(self.config.open_retry_interval()).await;
                }
            }
        }
    }

    async fn open_via_port(
        &self,
        port: &Arc<WrappedPort>,
        db: &DirectOptions,
    ) -> DbResult<Connection> {
        let abort = CancelToken::new();
        let listener = {
            let abort = abort.clone();
            port.add_close_listener(Box::new(move || {
                abort.cancel();
                async {}.boxed()
            }))
        };
        let opened = with_abort_timeout(
            &abort,
            self.config.open_timeout(),
            "opening database through client",
            async {
                let endpoint = port.provider.get_db_worker_port().await?;
                ProxiedConnection::open(
                    endpoint.channel,
                    db.clone(),
                    ProxyOptions::new(db.filename.clone()).remote_can_close_unexpectedly(true),
                    self.locks.clone(),
                    None,
                )
                .await
            },
        )
        .await;
        port.remove_close_listener(listener);
        let proxy = opened?;

        if port.is_closing() {
            proxy.mark_remote_closed();
            return Err(DbError::closed("client closed while opening the database"));
        }
        {
            let proxy = proxy.clone();
            port.add_close_listener(Box::new(move || {
                async move {
                    info!("aborting open connection because its client closed");
                    // close() is fire-and-forget once the remote is marked closed.
                    proxy.mark_remote_closed();
                    if let Err(err) = proxy.close().await {
                        warn!(error = %err, "error closing database connection");
                    }
                }
                .boxed()
            }));
        }
        *self.db_owner.lock() = Some(port.id);
        debug!(port = port.id, "database channel opened through client");
        Ok(Connection::Proxied(proxy))
    }

    async fn wait_initialized(&self) -> DbResult<()> {
        let mut ready = self.initialized.subscribe();
        ready
            .wait_for(|initialized| *initialized)
            .await
            .map(|_| ())
            .map_err(|_| DbError::Closed)
    }

    /// The sync session, created on first use once the database is ready.
    async fn session(&self) -> DbResult<Arc<dyn SyncSession>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(DbError::Closed);
        }
        if let Some(session) = self.session.lock().clone() {
            return Ok(session);
        }
        self.wait_initialized().await?;
        let _gate = self.session_gate.lock().await;
        if let Some(session) = self.session.lock().clone() {
            return Ok(session);
        }
        let adapter = self.adapter().ok_or(DbError::NotInitialized)?;
        let options = self
            .params
            .lock()
            .as_ref()
            .map(|params| params.stream_options.clone())
            .unwrap_or_default();
        let weak = self.self_ref.clone();
        let status: StatusSink = Arc::new(move |status: &SyncStatus| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.update_all_statuses(status);
            }
        });
        let context = SyncContext {
            adapter,
            connector: Arc::new(RelayConnector {
                coordinator: self.self_ref.clone(),
            }),
            status,
            subscriptions: self.subscriptions(),
            options,
        };
        let session = self.factory.create(context)?;
        *self.session.lock() = Some(session.clone());
        debug!("sync session created");
        Ok(session)
    }

    fn update_all_statuses(&self, status: &SyncStatus) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        *self.status.lock() = status.clone();
        let ports = self.ports.lock().clone();
        for port in ports {
            let delivered =
                std::panic::catch_unwind(AssertUnwindSafe(|| port.provider.status_changed(status)));
            if delivered.is_err() {
                error!(port = port.id, "status listener panicked");
            }
        }
    }

    /// Later calls reconnect with the newest options.
    pub async fn connect(&self, options: ConnectOptions) -> DbResult<()> {
        *self.last_connect.lock() = Some(options.clone());
        self.session().await?.connect(options).await
    }

    pub async fn disconnect(&self) -> DbResult<()> {
        let session = self.session.lock().clone();
        match session {
            Some(session) => session.disconnect().await,
            None => Ok(()),
        }
    }

    pub fn trigger_crud_upload(&self) {
        let session = self.session.lock().clone();
        if let Some(session) = session {
            session.trigger_crud_upload();
        }
    }

    pub async fn has_completed_sync(&self) -> DbResult<bool> {
        self.session().await?.has_completed_sync().await
    }

    pub async fn get_write_checkpoint(&self) -> DbResult<String> {
        self.session().await?.get_write_checkpoint().await
    }

    /// Ports stay registered.
    pub async fn dispose(&self) -> DbResult<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.adapter_events.lock().take();
        let session = self.session.lock().take();
        info!("disposing shared coordinator");
        match session {
            Some(session) => session.dispose().await,
            None => Ok(()),
        }
    }

    async fn relay_fetch_credentials(&self) -> DbResult<Option<Credentials>> {
        let port = self
            .last_port()
            .ok_or_else(|| DbError::NoClient("fetch_credentials".to_string()))?;
        let slot = RelaySlot::install(&self.credentials_relay, port.id);
        self.note(
            LogLevel::Debug,
            format!("requesting credentials from client port {}", port.id),
        );
        match with_abort(&slot.token, port.provider.fetch_credentials()).await {
            Err(DbError::Cancelled) if slot.token.is_cancelled() => Err(DbError::RelayTargetGone(
                format!("client port {} closed while fetching credentials", port.id),
            )),
            other => other,
        }
    }

    async fn relay_invalidate_credentials(&self) -> DbResult<()> {
        let port = self
            .last_port()
            .ok_or_else(|| DbError::NoClient("invalidate_credentials".to_string()))?;
        if let Err(err) = port.provider.invalidate_credentials().await {
            self.note(
                LogLevel::Error,
                format!("error invalidating credentials on client port {}: {err}", port.id),
            );
        }
        Ok(())
    }

    async fn relay_upload_crud(&self) -> DbResult<()> {
        let port = self
            .last_port()
            .ok_or_else(|| DbError::NoClient("upload_crud".to_string()))?;
        let slot = RelaySlot::install(&self.upload_relay, port.id);
        match with_abort(&slot.token, port.provider.upload_crud()).await {
            // The session treats a completed upload call as "try again".
            Err(DbError::Cancelled) if slot.token.is_cancelled() => {
                debug!(port = port.id, "upload target closed; upload will be retried");
                Ok(())
            }
            other => other,
        }
    }
}

/// The connector handed to the sync session: every call is relayed to a
/// client.
struct RelayConnector {
    coordinator: Weak<SharedCoordinator>,
}

impl RelayConnector {
    fn coordinator(&self) -> DbResult<Arc<SharedCoordinator>> {
        self.coordinator.upgrade().ok_or(DbError::Closed)
    }
}

#[async_trait]
impl RemoteConnector for RelayConnector {
    async fn fetch_credentials(&self) -> DbResult<Option<Credentials>> {
        self.coordinator()?.relay_fetch_credentials().await
    }

    async fn upload_data(&self) -> DbResult<()> {
        self.coordinator()?.relay_upload_crud().await
    }

    async fn invalidate_credentials(&self) -> DbResult<()> {
        self.coordinator()?.relay_invalidate_credentials().await
    }
}
