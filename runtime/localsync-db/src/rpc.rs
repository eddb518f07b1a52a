//! Request/response protocol between a proxied connection and its worker.
//!
//! Every message is one envelope encoded with msgpack or JSON; on byte
//! streams envelopes travel as little-endian u32 length-prefixed frames.
//! Replies carry the id of their request. Frames with `request_id == 0` are
//! unsolicited events; the only event today is [`EVENT_TABLES_UPDATED`].

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use crate::connection::ChangeListener;
use crate::connection::direct::DirectOptions;
use crate::error::{DbError, DbResult};
use crate::listeners::{ListenerGuard, ListenerSet};
use crate::types::{QueryResult, SqlValue, TableChange};

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

pub const EVENT_TABLES_UPDATED: &str = "__tables_updated__";

pub mod entry {
    pub const OPEN: &str = "open";
    pub const INIT: &str = "init";
    pub const EXECUTE: &str = "execute";
    pub const EXECUTE_BATCH: &str = "execute_batch";
    pub const MARK_HOLD: &str = "mark_hold";
    pub const RELEASE_HOLD: &str = "release_hold";
    pub const IS_AUTO_COMMIT: &str = "is_auto_commit";
    pub const CLOSE: &str = "close";
    pub const PING: &str = "__ping__";
}

const STATUS_OK: &str = "Ok";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireCodec {
    #[default]
    Msgpack,
    Json,
}

impl WireCodec {
    pub fn as_str(self) -> &'static str {
        match self {
            WireCodec::Msgpack => "msgpack",
            WireCodec::Json => "json",
        }
    }
}

impl FromStr for WireCodec {
    type Err = DbError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "msgpack" => Ok(WireCodec::Msgpack),
            "json" => Ok(WireCodec::Json),
            other => Err(DbError::Protocol(format!("Unsupported payload codec '{other}'"))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: u64,
    pub entry: String,
    pub timeout_ms: u32,
    pub codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_b64: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub status: String,
    pub codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

impl RequestEnvelope {
    pub fn new(request_id: u64, entry: &str, codec: WireCodec, payload: Vec<u8>) -> Self {
        Self {
            request_id,
            entry: entry.to_string(),
            timeout_ms: 0,
            codec: codec.as_str().to_string(),
            payload: Some(ByteBuf::from(payload)),
            payload_b64: None,
        }
    }

    pub fn payload_bytes(&self) -> DbResult<Vec<u8>> {
        extract_payload(&self.payload, &self.payload_b64)
    }
}

impl ResponseEnvelope {
    pub fn ok(request: &RequestEnvelope, payload: Vec<u8>) -> Self {
        Self {
            request_id: request.request_id,
            status: STATUS_OK.to_string(),
            codec: request.codec.clone(),
            payload: Some(ByteBuf::from(payload)),
            payload_b64: None,
            error: None,
            entry: Some(request.entry.clone()),
        }
    }

    pub fn error(request_id: u64, entry: Option<&str>, err: &DbError) -> Self {
        Self {
            request_id,
            status: error_status(err).to_string(),
            codec: "raw".to_string(),
            payload: None,
            payload_b64: None,
            error: Some(wire_message(err)),
            entry: entry.map(str::to_string),
        }
    }

    pub fn event(change: &TableChange, codec: WireCodec) -> DbResult<Self> {
        Ok(Self {
            request_id: 0,
            status: STATUS_OK.to_string(),
            codec: codec.as_str().to_string(),
            payload: Some(ByteBuf::from(encode_payload(change, codec)?)),
            payload_b64: None,
            error: None,
            entry: Some(EVENT_TABLES_UPDATED.to_string()),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    pub fn payload_bytes(&self) -> DbResult<Vec<u8>> {
        extract_payload(&self.payload, &self.payload_b64)
    }

    /// Converts an error reply back into the error it carries.
    pub fn into_error(self) -> DbError {
        error_from_status(&self.status, self.error.unwrap_or_default())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenRequest {
    pub options: DirectOptions,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OpenResponse {
    pub client_id: u64,
    pub requires_holds: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<SqlValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchRequest {
    pub sql: String,
    #[serde(default)]
    pub param_rows: Vec<Vec<SqlValue>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HoldMessage {
    pub id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlagResponse {
    pub value: bool,
}

pub type ExecuteResponse = QueryResult;

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame exceeds max size",
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let size = frame_len(payload)?;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

pub async fn read_frame_async<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header).await {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame exceeds max size",
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame_async<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let size = frame_len(payload)?;
    writer.write_all(&size.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

fn frame_len(payload: &[u8]) -> io::Result<u32> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Frame exceeds max size",
        ));
    }
    Ok(payload.len() as u32)
}

fn extract_payload(payload: &Option<ByteBuf>, payload_b64: &Option<String>) -> DbResult<Vec<u8>> {
    if let Some(payload) = payload {
        return Ok(payload.clone().into_vec());
    }
    if let Some(encoded) = payload_b64 {
        return BASE64
            .decode(encoded)
            .map_err(|err| DbError::Protocol(format!("Invalid payload base64: {err}")));
    }
    Ok(Vec::new())
}

/// Encodes an envelope for the wire. JSON cannot carry raw bytes, so the
/// payload moves to its base64 field.
pub fn encode_request(mut envelope: RequestEnvelope, wire: WireCodec) -> DbResult<Vec<u8>> {
    if wire == WireCodec::Json {
        envelope.payload_b64 = envelope.payload.take().map(|p| BASE64.encode(p.as_ref()));
    }
    encode_message(&envelope, wire)
}

pub fn encode_response(mut envelope: ResponseEnvelope, wire: WireCodec) -> DbResult<Vec<u8>> {
    if wire == WireCodec::Json {
        envelope.payload_b64 = envelope.payload.take().map(|p| BASE64.encode(p.as_ref()));
    }
    encode_message(&envelope, wire)
}

fn encode_message<T: Serialize>(message: &T, wire: WireCodec) -> DbResult<Vec<u8>> {
    match wire {
        WireCodec::Msgpack => {
            rmp_serde::to_vec_named(message).map_err(|err| DbError::Protocol(err.to_string()))
        }
        WireCodec::Json => {
            serde_json::to_vec(message).map_err(|err| DbError::Protocol(err.to_string()))
        }
    }
}

/// Decodes an envelope, detecting its wire codec.
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<(T, WireCodec)> {
    if let Ok(message) = rmp_serde::from_slice::<T>(bytes) {
        return Ok((message, WireCodec::Msgpack));
    }
    let message = serde_json::from_slice::<T>(bytes)
        .map_err(|err| DbError::Protocol(format!("Invalid message: {err}")))?;
    Ok((message, WireCodec::Json))
}

pub fn decode_payload<T: DeserializeOwned>(payload: &[u8], codec: &str) -> DbResult<T> {
    match codec.parse::<WireCodec>()? {
        WireCodec::Msgpack => {
            rmp_serde::from_slice(payload).map_err(|err| DbError::Protocol(err.to_string()))
        }
        WireCodec::Json => {
            serde_json::from_slice(payload).map_err(|err| DbError::Protocol(err.to_string()))
        }
    }
}

pub fn encode_payload<T: Serialize>(payload: &T, codec: WireCodec) -> DbResult<Vec<u8>> {
    encode_message(payload, codec)
}

pub fn error_status(err: &DbError) -> &'static str {
    match err {
        DbError::Sql(_) => "SqlError",
        DbError::ConnectionClosed(_) => "ConnectionClosed",
        DbError::Closed => "Closed",
        DbError::Closing => "Closing",
        DbError::NotInitialized => "NotInitialized",
        DbError::Cancelled => "Cancelled",
        DbError::LockTimeout(_) | DbError::Timeout(_) => "Timeout",
        DbError::Protocol(_) => "InvalidInput",
        DbError::EmptyResult => "EmptyResult",
        _ => "InternalError",
    }
}

fn wire_message(err: &DbError) -> String {
    match err {
        DbError::Sql(message)
        | DbError::ConnectionClosed(message)
        | DbError::Protocol(message)
        | DbError::Timeout(message)
        | DbError::LockTimeout(message) => message.clone(),
        other => other.to_string(),
    }
}

pub fn error_from_status(status: &str, message: String) -> DbError {
    match status {
        "SqlError" => DbError::Sql(message),
        "ConnectionClosed" => DbError::ConnectionClosed(message),
        "Closed" => DbError::Closed,
        "Closing" => DbError::Closing,
        "NotInitialized" => DbError::NotInitialized,
        "Cancelled" => DbError::Cancelled,
        "Timeout" => DbError::Timeout(message),
        "InvalidInput" => DbError::Protocol(message),
        "EmptyResult" => DbError::EmptyResult,
        other => DbError::Remote {
            status: other.to_string(),
            message,
        },
    }
}

/// How to stop whatever serves the far end of a channel without a
/// handshake.
pub enum Terminator {
    Detached,
    Task(AbortHandle),
    Process(Child),
}

impl Terminator {
    fn terminate(&mut self) {
        match self {
            Terminator::Detached => {}
            Terminator::Task(handle) => handle.abort(),
            Terminator::Process(child) => {
                if let Err(err) = child.start_kill() {
                    debug!(error = %err, "worker process already gone");
                }
            }
        }
    }
}

type Waiters = HashMap<u64, oneshot::Sender<ResponseEnvelope>>;

struct ChannelShared {
    /// `None` once the incoming side has ended.
    pending: Mutex<Option<Waiters>>,
    events: Arc<ListenerSet<ChangeListener>>,
}

impl ChannelShared {
    fn dispatch_event(&self, response: &ResponseEnvelope) {
        if response.entry.as_deref() != Some(EVENT_TABLES_UPDATED) {
            debug!(entry = ?response.entry, "ignoring unknown event");
            return;
        }
        let change = response
            .payload_bytes()
            .and_then(|bytes| decode_payload::<TableChange>(&bytes, &response.codec));
        match change {
            Ok(change) => self.events.iterate(|listener| listener(&change)),
            Err(err) => warn!(error = %err, "malformed change event"),
        }
    }
}

/// The calling side of a worker channel.
pub struct RemoteChannel {
    codec: WireCodec,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    next_id: AtomicU64,
    shared: Arc<ChannelShared>,
    reader: JoinHandle<()>,
    terminator: Mutex<Terminator>,
}

/// The serving side of an in-process channel.
pub struct ServerEnd {
    pub requests: mpsc::UnboundedReceiver<Vec<u8>>,
    pub replies: mpsc::UnboundedSender<Vec<u8>>,
}

impl RemoteChannel {
    pub fn new(
        outgoing: mpsc::UnboundedSender<Vec<u8>>,
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
        codec: WireCodec,
        terminator: Terminator,
    ) -> Arc<Self> {
        let shared = Arc::new(ChannelShared {
            pending: Mutex::new(Some(HashMap::new())),
            events: ListenerSet::new(),
        });
        let reader = tokio::spawn(pump(shared.clone(), incoming));
        Arc::new(Self {
            codec,
            outgoing,
            next_id: AtomicU64::new(1),
            shared,
            reader,
            terminator: Mutex::new(terminator),
        })
    }

    /// A channel whose far end is served by a task in this process.
    pub fn in_process(codec: WireCodec) -> (Arc<Self>, ServerEnd) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let channel = Self::new(request_tx, reply_rx, codec, Terminator::Detached);
        (
            channel,
            ServerEnd {
                requests: request_rx,
                replies: reply_tx,
            },
        )
    }

    pub fn codec(&self) -> WireCodec {
        self.codec
    }

    pub fn set_terminator(&self, terminator: Terminator) {
        *self.terminator.lock() = terminator;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.pending.lock().is_none()
    }

    pub async fn call<Req, Resp>(&self, entry: &str, request: &Req) -> DbResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = encode_payload(request, self.codec)?;
        let frame = encode_request(
            RequestEnvelope::new(request_id, entry, self.codec, payload),
            self.codec,
        )?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            let Some(waiters) = pending.as_mut() else {
                return Err(DbError::closed("worker channel closed"));
            };
            waiters.insert(request_id, tx);
        }
        let _waiting = PendingCall {
            shared: &self.shared,
            request_id,
        };
        if self.outgoing.send(frame).is_err() {
            return Err(DbError::closed("worker channel closed"));
        }
        let response = rx
            .await
            .map_err(|_| DbError::closed(format!("worker went away during `{entry}`")))?;
        if !response.is_ok() {
            return Err(response.into_error());
        }
        let bytes = response.payload_bytes()?;
        decode_payload(&bytes, &response.codec)
    }

    pub fn subscribe(&self, listener: Arc<ChangeListener>) -> ListenerGuard {
        self.shared.events.register(listener)
    }

    /// Stops the far end immediately. Pending calls fail once the incoming
    /// side observes the loss.
    pub fn terminate(&self) {
        self.terminator.lock().terminate();
    }
}

impl Drop for RemoteChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

struct PendingCall<'a> {
    shared: &'a ChannelShared,
    request_id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if let Some(waiters) = self.shared.pending.lock().as_mut() {
            waiters.remove(&self.request_id);
        }
    }
}

async fn pump(shared: Arc<ChannelShared>, mut incoming: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = incoming.recv().await {
        let response = match decode_message::<ResponseEnvelope>(&frame) {
            Ok((response, _)) => response,
            Err(err) => {
                warn!(error = %err, "dropping undecodable reply");
                continue;
            }
        };
        if response.request_id == 0 {
            shared.dispatch_event(&response);
            continue;
        }
        let waiter = shared
            .pending
            .lock()
            .as_mut()
            .and_then(|waiters| waiters.remove(&response.request_id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => debug!(request_id = response.request_id, "reply for unknown request"),
        }
    }
    let abandoned = shared.pending.lock().take().map_or(0, |waiters| waiters.len());
    debug!(abandoned, "worker channel ended");
}
