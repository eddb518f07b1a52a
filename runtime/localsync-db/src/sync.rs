//! Interfaces to the sync layer.
//!
//! The operation-log merge, checksum validation and the streaming protocol
//! live outside this crate. The coordinator only needs to create a session,
//! drive its lifecycle, and route the session's credential and upload
//! requests back to a client.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::adapter::LockedAdapter;
use crate::connection::DirectOptions;
use crate::error::DbResult;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub endpoint: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStatus {
    pub connected: bool,
    pub connecting: bool,
    pub downloading: bool,
    pub uploading: bool,
    pub has_synced: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SyncStatus {
    pub fn connected_at(at: DateTime<Utc>) -> Self {
        Self {
            connected: true,
            has_synced: true,
            last_synced_at: Some(at),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Passed through to the sync service as client parameters.
    pub params: BTreeMap<String, serde_json::Value>,
    pub retry_delay_ms: Option<u64>,
    pub crud_upload_throttle_ms: Option<u64>,
}

/// A stream the client wants synced, with its parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamSubscription {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl StreamSubscription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: None,
        }
    }

    /// Identity used to de-duplicate subscriptions across clients.
    pub fn key(&self) -> String {
        match &self.params {
            Some(params) => format!("{}:{params}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    /// Forward coordinator log lines to every connected client.
    pub broadcast_logs: bool,
    pub retry_delay_ms: u64,
    pub crud_upload_throttle_ms: u64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            broadcast_logs: false,
            retry_delay_ms: 5_000,
            crud_upload_throttle_ms: 1_000,
        }
    }
}

/// Parameters fixed by the first client that configures the coordinator.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncParams {
    pub db: DirectOptions,
    #[serde(default)]
    pub stream_options: StreamOptions,
}

impl SyncParams {
    pub fn new(db: DirectOptions) -> Self {
        Self {
            db,
            stream_options: StreamOptions::default(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.db.filename
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub op_id: String,
    pub op: String,
    pub object_type: Option<String>,
    pub object_id: Option<String>,
    pub subkey: Option<String>,
    pub data: Option<String>,
    pub checksum: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncDataBucket {
    pub bucket: String,
    pub data: Vec<OplogEntry>,
    pub has_more: bool,
    pub after: Option<String>,
    pub next_after: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncDataBatch {
    pub buckets: Vec<SyncDataBucket>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketChecksum {
    pub bucket: String,
    pub checksum: i64,
    pub count: Option<u64>,
    pub priority: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_op_id: String,
    pub write_checkpoint: Option<String>,
    pub buckets: Vec<BucketChecksum>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLocalResult {
    pub ready: bool,
    pub checkpoint_valid: bool,
    #[serde(default)]
    pub checkpoint_failures: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrudEntry {
    pub client_id: i64,
    pub op: String,
    pub table: String,
    pub id: String,
    pub tx_id: Option<i64>,
    pub data: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrudBatch {
    pub entries: Vec<CrudEntry>,
    pub have_more: bool,
}

/// Produces the write checkpoint a local target should advance to.
pub type WriteCheckpointFetcher =
    Box<dyn FnOnce() -> BoxFuture<'static, DbResult<String>> + Send>;

/// Local operation-log storage the sync session writes through.
#[async_trait]
pub trait BucketStorage: Send + Sync {
    async fn save_sync_data(&self, batch: SyncDataBatch) -> DbResult<()>;

    async fn sync_local_database(&self, checkpoint: &Checkpoint) -> DbResult<SyncLocalResult>;

    async fn remove_buckets(&self, buckets: &[String]) -> DbResult<()>;

    async fn get_crud_batch(&self, limit: usize) -> DbResult<Option<CrudBatch>>;

    async fn update_local_target(&self, fetch: WriteCheckpointFetcher) -> DbResult<bool>;

    async fn force_compact(&self) -> DbResult<()>;
}

/// The application's backend: credentials and uploads.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn fetch_credentials(&self) -> DbResult<Option<Credentials>>;

    async fn upload_data(&self) -> DbResult<()>;

    async fn invalidate_credentials(&self) -> DbResult<()> {
        Ok(())
    }
}

pub type StatusSink = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

#[async_trait]
pub trait SyncSession: Send + Sync {
    async fn connect(&self, options: ConnectOptions) -> DbResult<()>;

    async fn disconnect(&self) -> DbResult<()>;

    /// Schedules an upload of pending local changes.
    fn trigger_crud_upload(&self);

    async fn has_completed_sync(&self) -> DbResult<bool>;

    async fn get_write_checkpoint(&self) -> DbResult<String>;

    fn update_subscriptions(&self, subscriptions: &[StreamSubscription]);

    fn status(&self) -> SyncStatus;

    async fn dispose(&self) -> DbResult<()> {
        self.disconnect().await
    }
}

/// Everything a session needs from the coordinator that owns it.
#[derive(Clone)]
pub struct SyncContext {
    pub adapter: Arc<LockedAdapter>,
    pub connector: Arc<dyn RemoteConnector>,
    /// Receives every status change; the coordinator fans it out to clients.
    pub status: StatusSink,
    pub subscriptions: Vec<StreamSubscription>,
    pub options: StreamOptions,
}

pub trait SyncSessionFactory: Send + Sync {
    fn create(&self, context: SyncContext) -> DbResult<Arc<dyn SyncSession>>;
}
