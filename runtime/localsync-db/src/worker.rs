//! Serving side of the worker protocol.
//!
//! A worker owns one [`ConnectionRegistry`]. Every client channel gets a
//! [`ClientSession`] which opens a [`SharedConnection`] from that registry,
//! so many clients asking for the same file share one physical connection.
//! The connection closes when its last client leaves.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::connection::ChangeListener;
use crate::connection::direct::{DirectConnection, DirectOptions};
use crate::connection::proxy::{EndpointFactory, ProxiedConnection, ProxyOptions};
use crate::error::{DbError, DbResult};
use crate::listeners::ListenerGuard;
use crate::locks::LockService;
use crate::rpc::{
    self, BatchRequest, ExecuteRequest, FlagResponse, HoldMessage, OpenRequest, OpenResponse,
    RemoteChannel, RequestEnvelope, ResponseEnvelope, Terminator, WireCodec, entry,
};
use crate::types::{QueryResult, SqlValue, TableChange};

/// Destination for encoded reply frames.
pub trait FrameSink: Send + Sync + 'static {
    /// Returns `false` once the peer can no longer receive frames.
    fn send_frame(&self, frame: Vec<u8>) -> bool;
}

impl FrameSink for mpsc::UnboundedSender<Vec<u8>> {
    fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.send(frame).is_ok()
    }
}

struct RegistryEntry {
    client_ids: HashSet<u64>,
    connection: Arc<DirectConnection>,
}

/// Open connections of one worker, keyed by filename.
pub struct ConnectionRegistry {
    open_gate: AsyncMutex<()>,
    entries: Mutex<HashMap<String, RegistryEntry>>,
    next_client_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open_gate: AsyncMutex::new(()),
            entries: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        })
    }

    /// Opens `options.filename` for a new client, reusing the physical
    /// connection when the file is already open. Opens are serialized.
    pub async fn open(self: &Arc<Self>, options: DirectOptions) -> DbResult<SharedConnection> {
        let _gate = self.open_gate.lock().await;
        let filename = options.filename.clone();
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let existing = self
            .entries
            .lock()
            .get(&filename)
            .map(|entry| entry.connection.clone());
        let connection = match existing {
            Some(connection) => connection,
            None => {
                let connection = Arc::new(DirectConnection::new(options));
                connection.init().await?;
                connection
            }
        };
        self.entries
            .lock()
            .entry(filename.clone())
            .or_insert_with(|| RegistryEntry {
                client_ids: HashSet::new(),
                connection: connection.clone(),
            })
            .client_ids
            .insert(client_id);
        debug!(filename = %filename, client_id, "client attached");
        Ok(SharedConnection {
            registry: self.clone(),
            client_id,
            filename,
            connection,
            closing: AtomicBool::new(false),
            active_hold: Mutex::new(None),
        })
    }

    pub fn open_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn client_count(&self, filename: &str) -> usize {
        self.entries
            .lock()
            .get(filename)
            .map_or(0, |entry| entry.client_ids.len())
    }

    /// Removes a client; returns the connection when it was the last one.
    fn detach(&self, filename: &str, client_id: u64) -> Option<Arc<DirectConnection>> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(filename)?;
        entry.client_ids.remove(&client_id);
        if !entry.client_ids.is_empty() {
            return None;
        }
        entries.remove(filename).map(|entry| entry.connection)
    }
}

/// One client's view of a registry connection.
pub struct SharedConnection {
    registry: Arc<ConnectionRegistry>,
    client_id: u64,
    filename: String,
    connection: Arc<DirectConnection>,
    closing: AtomicBool,
    active_hold: Mutex<Option<String>>,
}

impl SharedConnection {
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn requires_holds(&self) -> bool {
        self.connection.requires_holds()
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        self.ensure_open()?;
        self.connection.execute(sql, params).await
    }

    pub async fn execute_batch(
        &self,
        sql: &str,
        param_rows: &[Vec<SqlValue>],
    ) -> DbResult<QueryResult> {
        self.ensure_open()?;
        self.connection.execute_batch(sql, param_rows).await
    }

    pub async fn is_auto_commit(&self) -> DbResult<bool> {
        self.ensure_open()?;
        self.connection.is_auto_commit().await
    }

    pub fn mark_hold(&self) -> DbResult<String> {
        self.ensure_open()?;
        let id = self.connection.mark_hold();
        *self.active_hold.lock() = Some(id.clone());
        Ok(id)
    }

    pub fn release_hold(&self, id: &str) {
        self.connection.release_hold(id);
        let mut active = self.active_hold.lock();
        if active.as_deref() == Some(id) {
            *active = None;
        }
    }

    pub fn register_change_listener(&self, listener: Arc<ChangeListener>) -> ListenerGuard {
        self.connection.register_change_listener(listener)
    }

    pub async fn close(&self) -> DbResult<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(hold) = self.active_hold.lock().take() {
            info!(client_id = self.client_id, hold = %hold, "client closed while holding the connection");
            self.connection.release_hold(&hold);
        }
        if let Some(connection) = self.registry.detach(&self.filename, self.client_id) {
            connection.close().await?;
        }
        Ok(())
    }
}

impl Drop for SharedConnection {
    fn drop(&mut self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hold) = self.active_hold.lock().take() {
            self.connection.release_hold(&hold);
        }
        let Some(connection) = self.registry.detach(&self.filename, self.client_id) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = connection.close().await {
                        warn!(error = %err, "closing abandoned connection failed");
                    }
                });
            }
            Err(_) => warn!(filename = %self.filename, "abandoned connection closed without a runtime"),
        }
    }
}

/// Serves the worker protocol for one client channel.
pub struct ClientSession {
    registry: Arc<ConnectionRegistry>,
    sink: Arc<dyn FrameSink>,
    connection: Option<SharedConnection>,
    events: Option<ListenerGuard>,
}

impl ClientSession {
    pub fn new(registry: Arc<ConnectionRegistry>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            registry,
            sink,
            connection: None,
            events: None,
        }
    }

    /// Handles frames until the client hangs up, then releases the client's
    /// connection.
    pub async fn serve(mut self, mut requests: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(frame) = requests.recv().await {
            let Some(reply) = self.handle_frame(&frame).await else {
                continue;
            };
            if !self.sink.send_frame(reply) {
                debug!("client stopped reading replies");
                break;
            }
        }
        if let Err(err) = self.close().await {
            warn!(error = %err, "closing connection of departed client failed");
        }
    }

    pub async fn handle_frame(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (request, wire) = match rpc::decode_message::<RequestEnvelope>(frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "undecodable request");
                let response = ResponseEnvelope::error(0, None, &err);
                return rpc::encode_response(response, WireCodec::Json).ok();
            }
        };
        let response = match self.dispatch(&request).await {
            Ok(payload) => ResponseEnvelope::ok(&request, payload),
            Err(err) => {
                debug!(entry = %request.entry, error = %err, "request failed");
                ResponseEnvelope::error(request.request_id, Some(&request.entry), &err)
            }
        };
        match rpc::encode_response(response, wire) {
            Ok(frame) => Some(frame),
            Err(err) => {
                error!(error = %err, "Failed to encode response");
                None
            }
        }
    }

    async fn dispatch(&mut self, request: &RequestEnvelope) -> DbResult<Vec<u8>> {
        let codec: WireCodec = request.codec.parse()?;
        let payload = request.payload_bytes()?;
        match request.entry.as_str() {
            entry::PING | entry::INIT => {
                if request.entry == entry::INIT {
                    self.connection()?;
                }
                rpc::encode_payload(&(), codec)
            }
            entry::OPEN => {
                let body: OpenRequest = rpc::decode_payload(&payload, &request.codec)?;
                let opened = self.open(body.options, codec).await?;
                rpc::encode_payload(&opened, codec)
            }
            entry::EXECUTE => {
                let body: ExecuteRequest = rpc::decode_payload(&payload, &request.codec)?;
                let result = self.connection()?.execute(&body.sql, &body.params).await?;
                rpc::encode_payload(&result, codec)
            }
            entry::EXECUTE_BATCH => {
                let body: BatchRequest = rpc::decode_payload(&payload, &request.codec)?;
                let result = self
                    .connection()?
                    .execute_batch(&body.sql, &body.param_rows)
                    .await?;
                rpc::encode_payload(&result, codec)
            }
            entry::MARK_HOLD => {
                let id = self.connection()?.mark_hold()?;
                rpc::encode_payload(&HoldMessage { id }, codec)
            }
            entry::RELEASE_HOLD => {
                let body: HoldMessage = rpc::decode_payload(&payload, &request.codec)?;
                self.connection()?.release_hold(&body.id);
                rpc::encode_payload(&(), codec)
            }
            entry::IS_AUTO_COMMIT => {
                let value = self.connection()?.is_auto_commit().await?;
                rpc::encode_payload(&FlagResponse { value }, codec)
            }
            entry::CLOSE => {
                self.close().await?;
                rpc::encode_payload(&(), codec)
            }
            other => Err(DbError::Protocol(format!("Unknown entry '{other}'"))),
        }
    }

    fn connection(&self) -> DbResult<&SharedConnection> {
        self.connection.as_ref().ok_or(DbError::NotInitialized)
    }

    async fn open(&mut self, options: DirectOptions, codec: WireCodec) -> DbResult<OpenResponse> {
        self.close().await?;
        let shared = self.registry.open(options).await?;
        let sink = self.sink.clone();
        self.events = Some(shared.register_change_listener(Arc::new(
            move |change: &TableChange| match ResponseEnvelope::event(change, codec)
                .and_then(|event| rpc::encode_response(event, codec))
            {
                Ok(frame) => {
                    sink.send_frame(frame);
                }
                Err(err) => warn!(error = %err, "failed to encode change event"),
            },
        )));
        let response = OpenResponse {
            client_id: shared.client_id(),
            requires_holds: shared.requires_holds(),
        };
        self.connection = Some(shared);
        Ok(response)
    }

    async fn close(&mut self) -> DbResult<()> {
        self.events.take();
        match self.connection.take() {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }
}

/// A worker living in this process. Each [`WorkerHost::connect`] call starts a
/// session task serving one new channel.
pub struct WorkerHost {
    registry: Arc<ConnectionRegistry>,
    codec: WireCodec,
}

impl WorkerHost {
    pub fn new(registry: Arc<ConnectionRegistry>, codec: WireCodec) -> Arc<Self> {
        Arc::new(Self { registry, codec })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn connect(&self) -> Arc<RemoteChannel> {
        let (channel, server) = RemoteChannel::in_process(self.codec);
        let session = ClientSession::new(self.registry.clone(), Arc::new(server.replies));
        let task = tokio::spawn(session.serve(server.requests));
        channel.set_terminator(Terminator::Task(task.abort_handle()));
        channel
    }

    pub fn endpoints(self: &Arc<Self>) -> EndpointFactory {
        let host = self.clone();
        Arc::new(move || host.connect())
    }

    /// Opens a proxied connection served by this host; it can be shared.
    pub async fn open_connection(
        self: &Arc<Self>,
        options: DirectOptions,
        proxy: ProxyOptions,
        locks: LockService,
    ) -> DbResult<Arc<ProxiedConnection>> {
        ProxiedConnection::open(self.connect(), options, proxy, locks, Some(self.endpoints())).await
    }
}

/// Channels to a `localsync-worker` child process over its stdio.
pub struct ProcessTransport;

impl ProcessTransport {
    pub fn spawn(program: &Path, args: &[String], codec: WireCodec) -> DbResult<Arc<RemoteChannel>> {
        let mut child = Command::new(program)
            .args(args)
            .arg("--codec")
            .arg(codec.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let (Some(mut stdin), Some(mut stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(DbError::Io("worker stdio unavailable".into()));
        };
        let pid = child.id();
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(frame) = request_rx.recv().await {
                if let Err(err) = rpc::write_frame_async(&mut stdin, &frame).await {
                    debug!(error = %err, "worker stdin closed");
                    break;
                }
            }
        });
        tokio::spawn(async move {
            loop {
                match rpc::read_frame_async(&mut stdout).await {
                    Ok(Some(frame)) => {
                        if reply_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "invalid frame from worker");
                        break;
                    }
                }
            }
            debug!(pid = ?pid, "worker stdout ended");
        });
        Ok(RemoteChannel::new(
            request_tx,
            reply_rx,
            codec,
            Terminator::Process(child),
        ))
    }
}
