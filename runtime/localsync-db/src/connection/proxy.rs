//! A connection living behind a worker channel.
//!
//! The worker may vanish at any time (a killed process, an aborted host
//! task). Calls therefore race an internal abort token: once the remote is
//! known to be gone, in-flight and future calls reject with
//! `ConnectionClosed` instead of waiting for a reply that never comes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::connection::ChangeListener;
use crate::connection::direct::DirectOptions;
use crate::error::{DbError, DbResult};
use crate::listeners::{ListenerGuard, ListenerSet};
use crate::locks::{LockHold, LockOptions, LockService};
use crate::rpc::{
    BatchRequest, ExecuteRequest, FlagResponse, HoldMessage, OpenRequest, OpenResponse,
    RemoteChannel, entry,
};
use crate::types::{QueryResult, SqlValue, TableChange};

/// Mints a fresh channel to the worker behind a connection.
pub type EndpointFactory = Arc<dyn Fn() -> Arc<RemoteChannel> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ProxyOptions {
    /// Identifies the database; prefixes the share lock name.
    pub identifier: String,
    /// The worker may disappear without closing its channel (a suspended or
    /// killed tab). Enables [`ProxiedConnection::mark_remote_closed`].
    pub remote_can_close_unexpectedly: bool,
}

impl ProxyOptions {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            remote_can_close_unexpectedly: false,
        }
    }

    pub fn remote_can_close_unexpectedly(mut self, value: bool) -> Self {
        self.remote_can_close_unexpectedly = value;
        self
    }
}

/// A channel to the same connection, handed to another client.
pub struct SharedConnectionEndpoint {
    pub identifier: String,
    pub channel: Arc<RemoteChannel>,
}

impl std::fmt::Debug for SharedConnectionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnectionEndpoint")
            .field("identifier", &self.identifier)
            .finish()
    }
}

pub struct ProxiedConnection {
    options: ProxyOptions,
    channel: Arc<RemoteChannel>,
    endpoints: Option<EndpointFactory>,
    locks: LockService,
    remote_closed: CancelToken,
    share_lock: String,
    share_abort: CancelToken,
    share_hold: Mutex<Option<LockHold>>,
    requires_holds: AtomicBool,
    listeners: Arc<ListenerSet<ChangeListener>>,
    _events: ListenerGuard,
}

impl ProxiedConnection {
    /// Opens `db` in the worker behind `channel`.
    pub async fn open(
        channel: Arc<RemoteChannel>,
        db: DirectOptions,
        options: ProxyOptions,
        locks: LockService,
        endpoints: Option<EndpointFactory>,
    ) -> DbResult<Arc<Self>> {
        let listeners: Arc<ListenerSet<ChangeListener>> = ListenerSet::new();
        let events = {
            let listeners = listeners.clone();
            channel.subscribe(Arc::new(move |change: &TableChange| {
                listeners.iterate(|listener| listener(change));
            }))
        };
        let share_lock = format!("shared-connection-{}-{}", options.identifier, Uuid::new_v4());
        let proxy = Arc::new(Self {
            options,
            channel,
            endpoints,
            locks,
            remote_closed: CancelToken::new(),
            share_lock,
            share_abort: CancelToken::new(),
            share_hold: Mutex::new(None),
            requires_holds: AtomicBool::new(false),
            listeners,
            _events: events,
        });
        let opened: OpenResponse = proxy
            .call(entry::OPEN, &OpenRequest { options: db })
            .await?;
        proxy
            .requires_holds
            .store(opened.requires_holds, Ordering::SeqCst);
        debug!(
            identifier = %proxy.options.identifier,
            client_id = opened.client_id,
            "proxied connection opened"
        );
        Ok(proxy)
    }

    pub fn identifier(&self) -> &str {
        &self.options.identifier
    }

    pub fn requires_holds(&self) -> bool {
        self.requires_holds.load(Ordering::SeqCst)
    }

    pub fn is_remote_closed(&self) -> bool {
        self.remote_closed.is_cancelled()
    }

    async fn call<Req, Resp>(&self, entry: &str, request: &Req) -> DbResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        if self.remote_closed.is_cancelled() {
            return Err(DbError::closed("remote connection closed"));
        }
        tokio::select! {
            biased;
            _ = self.remote_closed.cancelled() => {
                Err(DbError::closed(format!("remote closed during `{entry}`")))
            }
            result = self.channel.call(entry, request) => result,
        }
    }

    pub async fn init(&self) -> DbResult<()> {
        self.call(entry::INIT, &()).await
    }

    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        self.call(
            entry::EXECUTE,
            &ExecuteRequest {
                sql: sql.to_string(),
                params: params.to_vec(),
            },
        )
        .await
    }

    pub async fn execute_batch(
        &self,
        sql: &str,
        param_rows: &[Vec<SqlValue>],
    ) -> DbResult<QueryResult> {
        self.call(
            entry::EXECUTE_BATCH,
            &BatchRequest {
                sql: sql.to_string(),
                param_rows: param_rows.to_vec(),
            },
        )
        .await
    }

    pub async fn mark_hold(&self) -> DbResult<String> {
        let hold: HoldMessage = self.call(entry::MARK_HOLD, &()).await?;
        Ok(hold.id)
    }

    pub async fn release_hold(&self, id: &str) -> DbResult<()> {
        self.call(entry::RELEASE_HOLD, &HoldMessage { id: id.to_string() })
            .await
    }

    pub async fn is_auto_commit(&self) -> DbResult<bool> {
        let flag: FlagResponse = self.call(entry::IS_AUTO_COMMIT, &()).await?;
        Ok(flag.value)
    }

    pub fn register_change_listener(&self, listener: Arc<ChangeListener>) -> ListenerGuard {
        self.listeners.register(listener)
    }

    /// Records that the worker is gone: in-flight and later calls reject with
    /// `ConnectionClosed`.
    pub fn mark_remote_closed(&self) {
        if !self.options.remote_can_close_unexpectedly {
            warn!(identifier = %self.options.identifier, "remote marked closed on a connection not expecting it");
        }
        self.remote_closed.cancel();
    }

    /// Aborts everything in flight and stops the worker without a close
    /// handshake.
    pub fn force_close(&self) {
        info!(identifier = %self.options.identifier, "force closing proxied connection");
        self.remote_closed.cancel();
        self.release_share_lock();
        self.channel.terminate();
    }

    pub async fn close(&self) -> DbResult<()> {
        self.release_share_lock();
        if self.remote_closed.is_cancelled() {
            let channel = self.channel.clone();
            tokio::spawn(async move {
                if let Err(err) = channel.call::<_, ()>(entry::CLOSE, &()).await {
                    debug!(error = %err, "close of a closed remote failed");
                }
            });
            return Ok(());
        }
        self.call(entry::CLOSE, &()).await
    }

    /// A new channel to the same worker connection. The share lock is
    /// acquired on first use and held until this proxy closes. Its name is
    /// unique per proxy, so proxies of the same database never wait on each
    /// other here.
    pub async fn share_connection(&self) -> DbResult<SharedConnectionEndpoint> {
        let Some(endpoints) = self.endpoints.as_ref() else {
            return Err(DbError::NotShareable);
        };
        if self.share_hold.lock().is_none() && !self.share_abort.is_cancelled() {
            let options = LockOptions::exclusive().with_cancel(self.share_abort.clone());
            match self.locks.hold(&self.share_lock, options).await {
                Ok(hold) => {
                    let mut slot = self.share_hold.lock();
                    if slot.is_none() && !self.share_abort.is_cancelled() {
                        *slot = Some(hold);
                    }
                }
                Err(err) if err.is_cancellation() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(SharedConnectionEndpoint {
            identifier: self.options.identifier.clone(),
            channel: endpoints(),
        })
    }

    fn release_share_lock(&self) {
        self.share_abort.cancel();
        self.share_hold.lock().take();
    }
}
