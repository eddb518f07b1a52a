//! In-process executor over one rusqlite connection.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::hooks::Action;
use rusqlite::{OpenFlags, params_from_iter};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::ChangeListener;
use crate::error::{DbError, DbResult};
use crate::listeners::{ListenerGuard, ListenerSet};
use crate::types::{QueryResult, SqlValue, TableChange};

/// Returned by `mark_hold` when the storage mode does not need holds.
pub const NO_HOLD: &str = "no-hold";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    Memory,
    #[default]
    File,
    /// `locking_mode=EXCLUSIVE`: the file stays locked between statements, so
    /// callers bracket work with holds.
    Exclusive,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TempStore {
    #[default]
    Memory,
    File,
}

impl TempStore {
    fn pragma_value(self) -> &'static str {
        match self {
            TempStore::Memory => "MEMORY",
            TempStore::File => "FILE",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectOptions {
    pub filename: String,
    pub storage: StorageMode,
    pub temp_store: TempStore,
    /// Page cache size in KiB.
    pub cache_size_kb: Option<i64>,
    pub busy_timeout_ms: u64,
    pub encryption_key: Option<String>,
}

impl Default for DirectOptions {
    fn default() -> Self {
        Self {
            filename: ":memory:".to_string(),
            storage: StorageMode::File,
            temp_store: TempStore::Memory,
            cache_size_kb: None,
            busy_timeout_ms: 5_000,
            encryption_key: None,
        }
    }
}

impl DirectOptions {
    pub fn file(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Self::default()
        }
    }

    pub fn memory() -> Self {
        Self {
            storage: StorageMode::Memory,
            ..Self::default()
        }
    }

    pub fn with_storage(mut self, storage: StorageMode) -> Self {
        self.storage = storage;
        self
    }
}

enum ConnState {
    Unopened,
    Open(rusqlite::Connection),
    Closed,
}

impl ConnState {
    fn connection(&self) -> DbResult<&rusqlite::Connection> {
        match self {
            ConnState::Open(conn) => Ok(conn),
            ConnState::Unopened => Err(DbError::NotInitialized),
            ConnState::Closed => Err(DbError::Closed),
        }
    }
}

/// Executes statements on a single SQLite handle.
///
/// All statements pass through one async mutex, so statements issued by
/// concurrent callers never interleave on the handle. Table changes reported
/// by the update hook are coalesced and delivered from a spawned task once
/// the connection is back in autocommit mode. Only committed changes are
/// delivered: a rollback drops what its transaction touched.
pub struct DirectConnection {
    options: DirectOptions,
    state: AsyncMutex<ConnState>,
    uncommitted_tables: Arc<Mutex<BTreeSet<String>>>,
    pending_tables: Arc<Mutex<BTreeSet<String>>>,
    flush_scheduled: Arc<AtomicBool>,
    listeners: Arc<ListenerSet<ChangeListener>>,
    holds: Mutex<HashSet<String>>,
}

impl DirectConnection {
    pub fn new(options: DirectOptions) -> Self {
        Self {
            options,
            state: AsyncMutex::new(ConnState::Unopened),
            uncommitted_tables: Arc::new(Mutex::new(BTreeSet::new())),
            pending_tables: Arc::new(Mutex::new(BTreeSet::new())),
            flush_scheduled: Arc::new(AtomicBool::new(false)),
            listeners: ListenerSet::new(),
            holds: Mutex::new(HashSet::new()),
        }
    }

    pub fn options(&self) -> &DirectOptions {
        &self.options
    }

    pub fn filename(&self) -> &str {
        &self.options.filename
    }

    pub fn requires_holds(&self) -> bool {
        self.options.storage == StorageMode::Exclusive
    }

    pub async fn init(&self) -> DbResult<()> {
        let mut state = self.state.lock().await;
        match *state {
            ConnState::Open(_) => return Ok(()),
            ConnState::Closed => return Err(DbError::Closed),
            ConnState::Unopened => {}
        }
        let conn = self.open_sqlite()?;
        debug!(filename = %self.options.filename, storage = ?self.options.storage, "database opened");
        *state = ConnState::Open(conn);
        Ok(())
    }

    fn open_sqlite(&self) -> rusqlite::Result<rusqlite::Connection> {
        let conn = match self.options.storage {
            StorageMode::Memory => rusqlite::Connection::open_in_memory()?,
            StorageMode::File | StorageMode::Exclusive => rusqlite::Connection::open_with_flags(
                &self.options.filename,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
        };
        if let Some(key) = &self.options.encryption_key {
            conn.pragma_update(None, "key", key)?;
        }
        conn.busy_timeout(Duration::from_millis(self.options.busy_timeout_ms))?;
        conn.pragma_update(None, "temp_store", self.options.temp_store.pragma_value())?;
        if let Some(kb) = self.options.cache_size_kb {
            conn.pragma_update(None, "cache_size", -kb)?;
        }
        if self.options.storage == StorageMode::Exclusive {
            let _mode: String =
                conn.pragma_update_and_check(None, "locking_mode", "EXCLUSIVE", |row| row.get(0))?;
        }
        let touched = self.uncommitted_tables.clone();
        let _ = conn.update_hook(Some(
            move |_action: Action, _db: &str, table: &str, _rowid: i64| {
                touched.lock().insert(table.to_string());
            },
        ));
        let (touched, pending) = (self.uncommitted_tables.clone(), self.pending_tables.clone());
        let _ = conn.commit_hook(Some(move || {
            let committed = std::mem::take(&mut *touched.lock());
            pending.lock().extend(committed);
            false
        }));
        let touched = self.uncommitted_tables.clone();
        let _ = conn.rollback_hook(Some(move || {
            touched.lock().clear();
        }));
        Ok(conn)
    }

    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        let (result, autocommit) = {
            let state = self.state.lock().await;
            let conn = state.connection()?;
            (run_statement(conn, sql, params), conn.is_autocommit())
        };
        if autocommit {
            self.schedule_flush();
        }
        result
    }

    /// Runs `sql` once per parameter row inside a transaction. A failing row
    /// rolls the whole batch back and yields an empty result.
    pub async fn execute_batch(
        &self,
        sql: &str,
        param_rows: &[Vec<SqlValue>],
    ) -> DbResult<QueryResult> {
        let (result, autocommit) = {
            let state = self.state.lock().await;
            let conn = state.connection()?;
            (run_batch(conn, sql, param_rows), conn.is_autocommit())
        };
        if autocommit {
            self.schedule_flush();
        }
        result
    }

    pub async fn is_auto_commit(&self) -> DbResult<bool> {
        let state = self.state.lock().await;
        Ok(state.connection()?.is_autocommit())
    }

    pub fn register_change_listener(&self, listener: Arc<ChangeListener>) -> ListenerGuard {
        self.listeners.register(listener)
    }

    pub fn mark_hold(&self) -> String {
        if !self.requires_holds() {
            return NO_HOLD.to_string();
        }
        let id = Uuid::new_v4().to_string();
        self.holds.lock().insert(id.clone());
        id
    }

    pub fn release_hold(&self, id: &str) {
        if !self.requires_holds() {
            return;
        }
        if !self.holds.lock().remove(id) {
            warn!(hold = id, "release of unknown hold");
        }
    }

    pub fn active_holds(&self) -> usize {
        self.holds.lock().len()
    }

    /// Closes the handle. Closing twice is a no-op.
    pub async fn close(&self) -> DbResult<()> {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, ConnState::Closed);
        let active = self.active_holds();
        if active > 0 {
            info!(filename = %self.options.filename, active, "closing with active holds");
        }
        if let ConnState::Open(conn) = previous {
            conn.close().map_err(|(_, err)| DbError::from(err))?;
            debug!(filename = %self.options.filename, "database closed");
        }
        Ok(())
    }

    fn schedule_flush(&self) {
        if self.pending_tables.lock().is_empty() {
            return;
        }
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending = self.pending_tables.clone();
        let scheduled = self.flush_scheduled.clone();
        let listeners = self.listeners.clone();
        tokio::spawn(async move {
            scheduled.store(false, Ordering::SeqCst);
            let tables = std::mem::take(&mut *pending.lock());
            if tables.is_empty() {
                return;
            }
            let change = TableChange::from_set(tables);
            listeners.iterate(|listener| listener(&change));
        });
    }
}

fn run_statement(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> DbResult<QueryResult> {
    let mut stmt = match conn.prepare(sql) {
        Ok(stmt) => stmt,
        Err(rusqlite::Error::MultipleStatement) if params.is_empty() => {
            conn.execute_batch(sql)?;
            return Ok(QueryResult::affected(
                conn.changes() as u64,
                Some(conn.last_insert_rowid()),
            ));
        }
        Err(err) => return Err(err.into()),
    };
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut out = Vec::new();
    {
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                values.push(SqlValue::from(row.get_ref(idx)?));
            }
            out.push(values);
        }
    }
    Ok(QueryResult {
        columns,
        rows: out,
        rows_affected: conn.changes() as u64,
        insert_id: Some(conn.last_insert_rowid()),
    })
}

fn run_batch(
    conn: &rusqlite::Connection,
    sql: &str,
    param_rows: &[Vec<SqlValue>],
) -> DbResult<QueryResult> {
    // Inside an explicit transaction the batch nests as a savepoint.
    let nested = !conn.is_autocommit();
    let (begin, commit, rollback) = if nested {
        (
            "SAVEPOINT localsync_batch",
            "RELEASE localsync_batch",
            "ROLLBACK TO localsync_batch; RELEASE localsync_batch",
        )
    } else {
        ("BEGIN TRANSACTION", "COMMIT", "ROLLBACK")
    };
    conn.execute_batch(begin)?;
    let outcome = (|| -> rusqlite::Result<u64> {
        let mut stmt = conn.prepare(sql)?;
        let mut affected = 0u64;
        for row in param_rows {
            affected += stmt.execute(params_from_iter(row.iter()))? as u64;
        }
        Ok(affected)
    })();
    match outcome {
        Ok(affected) => {
            conn.execute_batch(commit)?;
            Ok(QueryResult::affected(affected, Some(conn.last_insert_rowid())))
        }
        Err(err) => {
            warn!(error = %err, "batch statement failed; rolling back");
            conn.execute_batch(rollback)?;
            Ok(QueryResult::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DirectConnection, DirectOptions, NO_HOLD, StorageMode};
    use crate::error::DbError;
    use crate::types::{SqlValue, TableChange};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn open_memory() -> DirectConnection {
        let conn = DirectConnection::new(DirectOptions::memory());
        conn.init().await.expect("init");
        conn.execute(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, title TEXT, done INTEGER)",
            &[],
        )
        .await
        .expect("schema");
        conn
    }

    #[tokio::test]
    async fn statements_require_init() {
        let conn = DirectConnection::new(DirectOptions::memory());
        let err = conn.execute("SELECT 1", &[]).await.expect_err("not initialized");
        assert_eq!(err, DbError::NotInitialized);
    }

    #[tokio::test]
    async fn execute_returns_rows_and_insert_id() {
        let conn = open_memory().await;
        let inserted = conn
            .execute(
                "INSERT INTO items (title, done) VALUES (?, ?)",
                &["ship".into(), true.into()],
            )
            .await
            .expect("insert");
        assert_eq!(inserted.rows_affected, 1);
        assert_eq!(inserted.insert_id, Some(1));
        let rows = conn
            .execute("SELECT id, title, done FROM items", &[])
            .await
            .expect("select")
            .into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("done"), Some(&SqlValue::Integer(1)));
    }

    #[tokio::test]
    async fn unparameterized_text_runs_every_statement() {
        let conn = open_memory().await;
        conn.execute(
            "INSERT INTO items (title) VALUES ('a'); INSERT INTO items (title) VALUES ('b');",
            &[],
        )
        .await
        .expect("multi");
        let count = conn
            .execute("SELECT count(*) AS n FROM items", &[])
            .await
            .expect("count")
            .into_rows();
        assert_eq!(count[0].get("n"), Some(&SqlValue::Integer(2)));
    }

    #[tokio::test]
    async fn failed_batch_rolls_back_everything() {
        let conn = open_memory().await;
        let rows = vec![
            vec![SqlValue::from(1), "a".into()],
            vec![SqlValue::from(1), "duplicate".into()],
        ];
        let result = conn
            .execute_batch("INSERT INTO items (id, title) VALUES (?, ?)", &rows)
            .await
            .expect("batch");
        assert_eq!(result.rows_affected, 0);
        assert!(result.rows.is_empty());
        let count = conn
            .execute("SELECT count(*) AS n FROM items", &[])
            .await
            .expect("count")
            .into_rows();
        assert_eq!(count[0].get("n"), Some(&SqlValue::Integer(0)));
        assert!(conn.is_auto_commit().await.expect("autocommit"));
    }

    #[tokio::test]
    async fn change_notifications_are_coalesced() {
        let conn = open_memory().await;
        let (tx, mut rx) = mpsc::unbounded_channel::<TableChange>();
        let _guard = conn.register_change_listener(Arc::new(move |change: &TableChange| {
            let _ = tx.send(change.clone());
        }));
        let rows: Vec<Vec<SqlValue>> = (0..3).map(|i| vec![format!("t{i}").into()]).collect();
        conn.execute_batch("INSERT INTO items (title) VALUES (?)", &rows)
            .await
            .expect("batch");
        let change = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("flush")
            .expect("change");
        assert_eq!(change.tables, vec!["items".to_string()]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rolled_back_changes_are_never_announced() {
        let conn = open_memory().await;
        conn.execute("CREATE TABLE notes (body TEXT)", &[])
            .await
            .expect("notes");
        let (tx, mut rx) = mpsc::unbounded_channel::<TableChange>();
        let _guard = conn.register_change_listener(Arc::new(move |change: &TableChange| {
            let _ = tx.send(change.clone());
        }));

        conn.execute("BEGIN", &[]).await.expect("begin");
        conn.execute("INSERT INTO items (title) VALUES ('discarded')", &[])
            .await
            .expect("insert");
        conn.execute("ROLLBACK", &[]).await.expect("rollback");
        let duplicate = vec![
            vec![SqlValue::from(1), "a".into()],
            vec![SqlValue::from(1), "b".into()],
        ];
        conn.execute_batch("INSERT INTO items (id, title) VALUES (?, ?)", &duplicate)
            .await
            .expect("failed batch");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        conn.execute("INSERT INTO notes (body) VALUES ('kept')", &[])
            .await
            .expect("insert note");
        let change = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("flush")
            .expect("change");
        assert_eq!(change.tables, vec!["notes".to_string()]);
    }

    #[tokio::test]
    async fn holds_only_tracked_for_exclusive_storage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("exclusive.db");
        let shared = DirectConnection::new(DirectOptions::file(path.display().to_string()));
        assert_eq!(shared.mark_hold(), NO_HOLD);

        let exclusive = DirectConnection::new(
            DirectOptions::file(path.display().to_string()).with_storage(StorageMode::Exclusive),
        );
        exclusive.init().await.expect("init");
        let hold = exclusive.mark_hold();
        assert_eq!(exclusive.active_holds(), 1);
        exclusive.release_hold(&hold);
        assert_eq!(exclusive.active_holds(), 0);
    }

    #[tokio::test]
    async fn closed_connection_rejects_statements() {
        let conn = open_memory().await;
        conn.close().await.expect("close");
        conn.close().await.expect("second close");
        assert_eq!(conn.execute("SELECT 1", &[]).await, Err(DbError::Closed));
        assert_eq!(conn.init().await, Err(DbError::Closed));
    }
}
