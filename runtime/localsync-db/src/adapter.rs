//! Lock discipline over one database connection. Every statement runs
//! while holding `db-lock-<name>`.
//!
//! At most one re-open is in flight; lock acquisitions wait for it.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::connection::{Connection, OpenFuture, SharedConnectionEndpoint};
use crate::error::{DbError, DbResult};
use crate::listeners::{ListenerGuard, ListenerSet};
use crate::locks::{LockOptions, LockService};
use crate::types::{QueryResult, Row, SqlValue, TableChange};

pub const DEFAULT_OPEN_ATTEMPTS: u32 = 3;
pub const DEFAULT_OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct AdapterOptions {
    pub name: String,
    pub reopen_on_connection_closed: bool,
    pub open_attempts: u32,
    pub open_retry_delay: Duration,
    /// Applied when an operation does not carry its own timeout.
    pub lock_timeout: Option<Duration>,
    /// Logs every statement with its duration.
    pub debug_mode: bool,
}

impl AdapterOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reopen_on_connection_closed: false,
            open_attempts: DEFAULT_OPEN_ATTEMPTS,
            open_retry_delay: DEFAULT_OPEN_RETRY_DELAY,
            lock_timeout: None,
            debug_mode: false,
        }
    }

    pub fn reopen_on_connection_closed(mut self, value: bool) -> Self {
        self.reopen_on_connection_closed = value;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct DbLockOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl DbLockOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterState {
    Opening,
    Ready,
    ReOpening,
    Closing,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdapterEvent {
    Initialized,
    TablesUpdated(TableChange),
    DatabaseReopened,
    Closing,
}

pub type AdapterListener = dyn Fn(&AdapterEvent) + Send + Sync;

type Opener = Box<dyn Fn() -> OpenFuture + Send + Sync>;

/// An in-flight re-open. Clones resolve to the same outcome.
pub type ReopenFuture = Shared<BoxFuture<'static, DbResult<()>>>;

pub struct LockedAdapter {
    self_ref: Weak<LockedAdapter>,
    options: AdapterOptions,
    opener: Opener,
    locks: LockService,
    db: Mutex<Option<Connection>>,
    change_guard: Mutex<Option<ListenerGuard>>,
    state: Mutex<AdapterState>,
    closing: AtomicBool,
    pending: Mutex<HashMap<u64, CancelToken>>,
    next_pending: AtomicU64,
    init: OnceCell<DbResult<()>>,
    reopen: Mutex<Option<ReopenFuture>>,
    listeners: Arc<ListenerSet<AdapterListener>>,
}

impl LockedAdapter {
    pub fn new<F, Fut>(options: AdapterOptions, locks: LockService, opener: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DbResult<Connection>> + Send + 'static,
    {
        let opener: Opener = Box::new(move || Box::pin(opener()) as OpenFuture);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            options,
            opener,
            locks,
            db: Mutex::new(None),
            change_guard: Mutex::new(None),
            state: Mutex::new(AdapterState::Opening),
            closing: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            next_pending: AtomicU64::new(1),
            init: OnceCell::new(),
            reopen: Mutex::new(None),
            listeners: ListenerSet::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn state(&self) -> AdapterState {
        *self.state.lock()
    }

    pub fn lock_name(&self) -> String {
        format!("db-lock-{}", self.options.name)
    }

    pub fn register_listener(&self, listener: Arc<AdapterListener>) -> ListenerGuard {
        self.listeners.register(listener)
    }

    fn emit(&self, event: &AdapterEvent) {
        self.listeners.iterate(|listener| listener(event));
    }

    fn set_state(&self, next: AdapterState) {
        let mut state = self.state.lock();
        let terminal = matches!(*state, AdapterState::Closing | AdapterState::Closed);
        if terminal && !matches!(next, AdapterState::Closing | AdapterState::Closed) {
            return;
        }
        *state = next;
    }

    /// Opens the connection. Concurrent and later callers share the outcome,
    /// including a fatal failure.
    pub async fn init(&self) -> DbResult<()> {
        self.init
            .get_or_init(|| async {
                let result = self.open_with_retries().await;
                match &result {
                    Ok(()) => {
                        self.set_state(AdapterState::Ready);
                        info!(db = %self.options.name, "database initialized");
                        self.emit(&AdapterEvent::Initialized);
                    }
                    Err(err) => error!(db = %self.options.name, error = %err, "database initialization failed"),
                }
                result
            })
            .await
            .clone()
    }

    async fn open_with_retries(&self) -> DbResult<()> {
        let attempts = self.options.open_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if self.closing.load(Ordering::SeqCst) {
                return Err(DbError::Closing);
            }
            match self.open_connection().await {
                Ok(()) => return Ok(()),
                Err(err) if self.closing.load(Ordering::SeqCst) => return Err(err),
                Err(err) => {
                    warn!(db = %self.options.name, attempt, attempts, error = %err, "failed to open database");
                    last_error = err.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.options.open_retry_delay).await;
                    }
                }
            }
        }
        Err(DbError::InitFailed {
            attempts,
            message: last_error,
        })
    }

    async fn open_connection(&self) -> DbResult<()> {
        let db = (self.opener)().await?;
        if let Err(err) = db.init().await {
            if let Err(close_err) = db.close().await {
                debug!(error = %close_err, "closing half-opened connection failed");
            }
            return Err(err);
        }
        let listeners = self.listeners.clone();
        let guard = db.register_change_listener(Arc::new(move |change: &TableChange| {
            let event = AdapterEvent::TablesUpdated(change.clone());
            listeners.iterate(|listener| listener(&event));
        }));
        *self.db.lock() = Some(db);
        *self.change_guard.lock() = Some(guard);
        // `close()` sets `closing` before taking the handle, so either it saw
        // this connection or this check sees the flag.
        if self.closing.load(Ordering::SeqCst) {
            self.discard_connection().await;
            return Err(DbError::closed("adapter closed while opening"));
        }
        Ok(())
    }

    async fn discard_connection(&self) {
        self.change_guard.lock().take();
        let db = self.db.lock().take();
        if let Some(db) = db {
            if let Err(err) = db.close().await {
                debug!(db = %self.options.name, error = %err, "closing discarded connection failed");
            }
        }
    }

    fn current_db(&self) -> DbResult<Connection> {
        self.db
            .lock()
            .clone()
            .ok_or_else(|| DbError::closed("database is not open"))
    }

    fn track_pending(&self, token: CancelToken) -> PendingAcquire<'_> {
        let id = self.next_pending.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(id, token);
        PendingAcquire { adapter: self, id }
    }

    async fn await_reopen(&self) -> DbResult<()> {
        let in_flight = self.reopen.lock().clone();
        match in_flight {
            Some(reopen) => reopen.await,
            None => Ok(()),
        }
    }

    async fn acquire<T, F, Fut>(&self, options: DbLockOptions, f: F) -> DbResult<T>
    where
        F: FnOnce(LockContext) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        if self.closing.load(Ordering::SeqCst) {
            return Err(DbError::Closing);
        }
        self.init().await?;
        self.await_reopen().await?;
        if self.closing.load(Ordering::SeqCst) {
            return Err(DbError::Closing);
        }
        let token = match &options.cancel {
            Some(cancel) => cancel.child(),
            None => CancelToken::new(),
        };
        let pending = self.track_pending(token.clone());
        let lock_options = LockOptions::exclusive()
            .with_cancel(token)
            .with_timeout(options.timeout.or(self.options.lock_timeout));
        let outcome = self
            .locks
            .request(&self.lock_name(), lock_options, || async {
                let db = self.current_db()?;
                let ctx = LockContext {
                    db: db.clone(),
                    debug_mode: self.options.debug_mode,
                };
                with_hold(&db, f(ctx)).await
            })
            .await;
        drop(pending);
        let result = match outcome {
            Ok(inner) => inner,
            Err(DbError::Cancelled) if self.closing.load(Ordering::SeqCst) => Err(DbError::Closing),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            if err.is_connection_closed() {
                self.on_connection_closed();
            }
        }
        result
    }

    fn on_connection_closed(&self) {
        if !self.options.reopen_on_connection_closed || self.closing.load(Ordering::SeqCst) {
            return;
        }
        debug!(db = %self.options.name, "connection closed; scheduling re-open");
        let _ = self.start_reopen();
    }

    pub async fn read_lock<T, F, Fut>(&self, f: F, options: DbLockOptions) -> DbResult<T>
    where
        F: FnOnce(LockContext) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.acquire(options, f).await
    }

    pub async fn write_lock<T, F, Fut>(&self, f: F, options: DbLockOptions) -> DbResult<T>
    where
        F: FnOnce(LockContext) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.acquire(options, f).await
    }

    pub async fn read_transaction<T, F, Fut>(&self, f: F, options: DbLockOptions) -> DbResult<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.read_lock(|ctx| run_transaction(ctx, "BEGIN", f), options)
            .await
    }

    pub async fn write_transaction<T, F, Fut>(&self, f: F, options: DbLockOptions) -> DbResult<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.write_lock(|ctx| run_transaction(ctx, "BEGIN EXCLUSIVE", f), options)
            .await
    }

    async fn retry_after_reopen<T, F, Fut>(&self, op: F) -> DbResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        match op().await {
            Err(err)
                if err.is_connection_closed()
                    && self.options.reopen_on_connection_closed
                    && !self.closing.load(Ordering::SeqCst) =>
            {
                debug!(db = %self.options.name, error = %err, "retrying once after re-open");
                op().await
            }
            other => other,
        }
    }

    /// Runs one statement under the write lock. Retried once after a re-open
    /// when the connection was lost.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        self.retry_after_reopen(|| {
            self.write_lock(
                move |ctx| async move { ctx.execute(sql, params).await },
                DbLockOptions::default(),
            )
        })
        .await
    }

    pub async fn execute_batch(
        &self,
        sql: &str,
        param_rows: &[Vec<SqlValue>],
    ) -> DbResult<QueryResult> {
        self.retry_after_reopen(|| {
            self.write_lock(
                move |ctx| async move { ctx.execute_batch(sql, param_rows).await },
                DbLockOptions::default(),
            )
        })
        .await
    }

    pub async fn get_all(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        self.read_lock(
            move |ctx| async move { ctx.get_all(sql, params).await },
            DbLockOptions::default(),
        )
        .await
    }

    pub async fn get_optional(&self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
        self.read_lock(
            move |ctx| async move { ctx.get_optional(sql, params).await },
            DbLockOptions::default(),
        )
        .await
    }

    pub async fn get(&self, sql: &str, params: &[SqlValue]) -> DbResult<Row> {
        self.read_lock(
            move |ctx| async move { ctx.get(sql, params).await },
            DbLockOptions::default(),
        )
        .await
    }

    pub async fn refresh_schema(&self) -> DbResult<()> {
        Ok(())
    }

    pub async fn share_connection(&self) -> DbResult<SharedConnectionEndpoint> {
        self.init().await?;
        self.current_db()?.share_connection().await
    }

    /// Concurrent callers share the re-open in flight.
    pub fn reopen_internal_db(&self) -> ReopenFuture {
        self.start_reopen()
    }

    fn start_reopen(&self) -> ReopenFuture {
        let mut slot = self.reopen.lock();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        let Some(this) = self.self_ref.upgrade() else {
            return futures::future::ready(Err(DbError::Closed)).boxed().shared();
        };
        let reopen = async move {
            let result = this.run_reopen().await;
            this.reopen.lock().take();
            result
        }
        .boxed()
        .shared();
        *slot = Some(reopen.clone());
        tokio::spawn(reopen.clone());
        reopen
    }

    async fn run_reopen(&self) -> DbResult<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(DbError::Closing);
        }
        self.set_state(AdapterState::ReOpening);
        info!(db = %self.options.name, "re-opening database");
        let token = CancelToken::new();
        let pending = self.track_pending(token.clone());
        let result = self
            .locks
            .request(
                &self.lock_name(),
                LockOptions::exclusive().with_cancel(token),
                || async {
                    self.change_guard.lock().take();
                    let previous = self.db.lock().take();
                    if let Some(previous) = previous {
                        tokio::spawn(async move {
                            if let Err(err) = previous.close().await {
                                debug!(error = %err, "closing lost connection failed");
                            }
                        });
                    }
                    self.open_with_retries().await
                },
            )
            .await
            .and_then(|opened| opened);
        drop(pending);
        match &result {
            Ok(()) if self.closing.load(Ordering::SeqCst) => {
                info!(db = %self.options.name, "re-open finished after close");
                return Err(DbError::Closing);
            }
            Ok(()) => {
                self.set_state(AdapterState::Ready);
                info!(db = %self.options.name, "database re-opened");
                self.emit(&AdapterEvent::DatabaseReopened);
            }
            Err(_) if self.closing.load(Ordering::SeqCst) => {
                info!(db = %self.options.name, "re-open abandoned by close");
            }
            Err(err) => error!(db = %self.options.name, error = %err, "re-open failed"),
        }
        result
    }

    /// Stops accepting work, aborts waiting acquisitions and closes the
    /// connection. A re-open racing this call closes what it opened.
    pub async fn close(&self) -> DbResult<()> {
        if !self.closing.swap(true, Ordering::SeqCst) {
            self.set_state(AdapterState::Closing);
            self.emit(&AdapterEvent::Closing);
            let waiting: Vec<CancelToken> = self.pending.lock().drain().map(|(_, t)| t).collect();
            for token in waiting {
                token.cancel();
            }
        }
        self.change_guard.lock().take();
        let db = self.db.lock().take();
        let result = match db {
            Some(db) => db.close().await,
            None => Ok(()),
        };
        self.set_state(AdapterState::Closed);
        result
    }
}

struct PendingAcquire<'a> {
    adapter: &'a LockedAdapter,
    id: u64,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        self.adapter.pending.lock().remove(&self.id);
    }
}

async fn with_hold<T, Fut>(db: &Connection, work: Fut) -> DbResult<T>
where
    Fut: Future<Output = DbResult<T>>,
{
    if !db.requires_holds() {
        return work.await;
    }
    let hold = db.mark_hold().await?;
    let result = work.await;
    if let Err(err) = db.release_hold(&hold).await {
        warn!(hold = %hold, error = %err, "failed to release hold");
    }
    result
}

async fn run_transaction<T, F, Fut>(ctx: LockContext, begin: &str, f: F) -> DbResult<T>
where
    F: FnOnce(Transaction) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    ctx.execute(begin, &[]).await?;
    let tx = Transaction {
        ctx,
        finalized: Arc::new(AtomicBool::new(false)),
    };
    let outcome = match f(tx.clone()).await {
        Ok(value) => tx.commit().await.map(|_| value),
        Err(err) => Err(err),
    };
    if outcome.is_err() {
        tx.rollback_if_open().await;
    }
    outcome
}

/// Statement access while the database lock is held.
#[derive(Clone)]
pub struct LockContext {
    db: Connection,
    debug_mode: bool,
}

impl LockContext {
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        let started = self.debug_mode.then(Instant::now);
        let result = self.db.execute(sql, params).await;
        if let Some(started) = started {
            debug!(
                target: "localsync::sql",
                sql,
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "statement executed"
            );
        }
        result
    }

    pub async fn execute_batch(
        &self,
        sql: &str,
        param_rows: &[Vec<SqlValue>],
    ) -> DbResult<QueryResult> {
        let started = self.debug_mode.then(Instant::now);
        let result = self.db.execute_batch(sql, param_rows).await;
        if let Some(started) = started {
            debug!(
                target: "localsync::sql",
                sql,
                rows = param_rows.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "batch executed"
            );
        }
        result
    }

    pub async fn get_all(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        Ok(self.execute(sql, params).await?.into_rows())
    }

    pub async fn get_optional(&self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
        Ok(self.get_all(sql, params).await?.into_iter().next())
    }

    pub async fn get(&self, sql: &str, params: &[SqlValue]) -> DbResult<Row> {
        self.get_optional(sql, params)
            .await?
            .ok_or(DbError::EmptyResult)
    }

    pub async fn is_auto_commit(&self) -> DbResult<bool> {
        self.db.is_auto_commit().await
    }
}

/// A transaction in progress. Committed automatically when the callback
/// succeeds unless it already committed or rolled back.
#[derive(Clone)]
pub struct Transaction {
    ctx: LockContext,
    finalized: Arc<AtomicBool>,
}

impl Transaction {
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Only a successful `COMMIT` finalizes; a failed one leaves the
    /// transaction open for rollback.
    pub async fn commit(&self) -> DbResult<QueryResult> {
        if self.is_finalized() {
            return Ok(QueryResult::default());
        }
        let result = self.ctx.execute("COMMIT", &[]).await?;
        self.finalized.store(true, Ordering::SeqCst);
        Ok(result)
    }

    pub async fn rollback(&self) -> DbResult<QueryResult> {
        self.finalized.store(true, Ordering::SeqCst);
        self.ctx.execute("ROLLBACK", &[]).await
    }

    async fn rollback_if_open(&self) {
        match self.ctx.is_auto_commit().await {
            Ok(true) => self.finalized.store(true, Ordering::SeqCst),
            Ok(false) => {
                if let Err(err) = self.rollback().await {
                    warn!(error = %err, "rollback failed");
                }
            }
            Err(err) => debug!(error = %err, "transaction state unknown; skipping rollback"),
        }
    }
}

impl Deref for Transaction {
    type Target = LockContext;

    fn deref(&self) -> &LockContext {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::{AdapterEvent, AdapterOptions, AdapterState, DbLockOptions, LockedAdapter};
    use crate::connection::{Connection, DirectConnection, DirectOptions, StorageMode};
    use crate::error::DbError;
    use crate::locks::{LockOptions, LockService};
    use crate::types::SqlValue;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn memory_adapter(name: &str) -> Arc<LockedAdapter> {
        let conn = Connection::direct(DirectOptions::memory());
        LockedAdapter::new(AdapterOptions::new(name), LockService::local(), move || {
            let conn = conn.clone();
            async move { Ok(conn) }
        })
    }

    async fn with_items(adapter: &LockedAdapter) {
        adapter
            .execute("CREATE TABLE items (id INTEGER PRIMARY KEY, title TEXT)", &[])
            .await
            .expect("schema");
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back() {
        let adapter = memory_adapter("tx");
        with_items(&adapter).await;
        let err = adapter
            .write_transaction(
                |tx| async move {
                    tx.execute("INSERT INTO items (title) VALUES ('lost')", &[])
                        .await?;
                    Err::<(), _>(DbError::Sql("constraint failed".into()))
                },
                DbLockOptions::default(),
            )
            .await
            .expect_err("callback error");
        assert_eq!(err, DbError::Sql("constraint failed".into()));
        let rows = adapter
            .get_all("SELECT * FROM items", &[])
            .await
            .expect("select");
        assert!(rows.is_empty());

        let committed = adapter
            .write_transaction(
                |tx| async move {
                    tx.execute("INSERT INTO items (title) VALUES ('kept')", &[])
                        .await?;
                    tx.commit().await?;
                    Ok(7)
                },
                DbLockOptions::default(),
            )
            .await
            .expect("commit");
        assert_eq!(committed, 7);
        let row = adapter
            .get("SELECT title FROM items", &[])
            .await
            .expect("row");
        assert_eq!(row.get("title").and_then(SqlValue::as_str), Some("kept"));
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_and_frees_the_connection() {
        let adapter = memory_adapter("deferred");
        adapter
            .execute("PRAGMA foreign_keys = ON", &[])
            .await
            .expect("pragma");
        adapter
            .execute("CREATE TABLE parent (id INTEGER PRIMARY KEY)", &[])
            .await
            .expect("parent");
        adapter
            .execute(
                "CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER \
                 REFERENCES parent(id) DEFERRABLE INITIALLY DEFERRED)",
                &[],
            )
            .await
            .expect("child");

        let err = adapter
            .write_transaction(
                |tx| async move {
                    tx.execute("INSERT INTO child (parent_id) VALUES (42)", &[])
                        .await?;
                    Ok(())
                },
                DbLockOptions::default(),
            )
            .await
            .expect_err("deferred violation at commit");
        assert!(matches!(err, DbError::Sql(_)));
        adapter
            .read_lock(
                |ctx| async move {
                    assert!(ctx.is_auto_commit().await?);
                    Ok(())
                },
                DbLockOptions::default(),
            )
            .await
            .expect("connection back in auto-commit");

        adapter
            .write_transaction(
                |tx| async move {
                    tx.execute("INSERT INTO parent (id) VALUES (1)", &[]).await?;
                    tx.execute("INSERT INTO child (parent_id) VALUES (1)", &[])
                        .await?;
                    Ok(())
                },
                DbLockOptions::default(),
            )
            .await
            .expect("next transaction");
        let rows = adapter
            .get_all("SELECT parent_id FROM child", &[])
            .await
            .expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("parent_id"), Some(&SqlValue::Integer(1)));
    }

    #[tokio::test]
    async fn get_fails_on_empty_result() {
        let adapter = memory_adapter("empty");
        with_items(&adapter).await;
        assert_eq!(
            adapter.get("SELECT * FROM items", &[]).await.err(),
            Some(DbError::EmptyResult)
        );
        assert!(
            adapter
                .get_optional("SELECT * FROM items", &[])
                .await
                .expect("optional")
                .is_none()
        );
    }

    #[tokio::test]
    async fn lock_timeout_applies_while_waiting() {
        let adapter = memory_adapter("busy");
        adapter.init().await.expect("init");
        let locks_holder = adapter.clone();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let holder = tokio::spawn(async move {
            locks_holder
                .write_lock(
                    |_ctx| async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(())
                    },
                    DbLockOptions::default(),
                )
                .await
        });
        started_rx.await.expect("holder started");
        let err = adapter
            .read_lock(
                |_ctx| async move { Ok(()) },
                DbLockOptions::timeout(Duration::from_millis(20)),
            )
            .await
            .expect_err("timed out");
        assert!(matches!(err, DbError::LockTimeout(name) if name == "db-lock-busy"));
        holder.await.expect("join").expect("holder");
    }

    #[tokio::test]
    async fn holds_are_released_on_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let direct = Arc::new(DirectConnection::new(
            DirectOptions::file(dir.path().join("holds.db").display().to_string())
                .with_storage(StorageMode::Exclusive),
        ));
        let adapter = {
            let direct = direct.clone();
            LockedAdapter::new(AdapterOptions::new("holds"), LockService::local(), move || {
                let conn = Connection::Direct(direct.clone());
                async move { Ok(conn) }
            })
        };
        let err = adapter
            .execute("SELECT * FROM missing_table", &[])
            .await
            .expect_err("sql error");
        assert!(matches!(err, DbError::Sql(_)));
        assert_eq!(direct.active_holds(), 0);
        adapter
            .write_lock(
                |ctx| async move {
                    assert!(ctx.is_auto_commit().await?);
                    Ok(())
                },
                DbLockOptions::default(),
            )
            .await
            .expect("lock");
        assert_eq!(direct.active_holds(), 0);
    }

    #[tokio::test]
    async fn init_failure_is_fatal_after_retries() {
        let opens = Arc::new(AtomicUsize::new(0));
        let mut options = AdapterOptions::new("broken");
        options.open_retry_delay = Duration::from_millis(1);
        let adapter = {
            let opens = opens.clone();
            LockedAdapter::new(options, LockService::local(), move || {
                opens.fetch_add(1, Ordering::SeqCst);
                async { Err(DbError::Io("disk unavailable".into())) }
            })
        };
        let first = adapter.execute("SELECT 1", &[]).await.expect_err("fatal");
        let second = adapter.get_all("SELECT 1", &[]).await.expect_err("fatal");
        assert!(matches!(first, DbError::InitFailed { attempts: 3, .. }));
        assert_eq!(first, second);
        assert_eq!(opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn concurrent_reopens_share_one_open() {
        let opens = Arc::new(AtomicUsize::new(0));
        let adapter = {
            let opens = opens.clone();
            LockedAdapter::new(
                AdapterOptions::new("reopen").reopen_on_connection_closed(true),
                LockService::local(),
                move || {
                    opens.fetch_add(1, Ordering::SeqCst);
                    async { Ok(Connection::direct(DirectOptions::memory())) }
                },
            )
        };
        adapter.init().await.expect("init");
        let reopened = Arc::new(AtomicUsize::new(0));
        let _guard = {
            let reopened = reopened.clone();
            adapter.register_listener(Arc::new(move |event: &AdapterEvent| {
                if *event == AdapterEvent::DatabaseReopened {
                    reopened.fetch_add(1, Ordering::SeqCst);
                }
            }))
        };
        let results =
            futures::future::join_all((0..5).map(|_| adapter.reopen_internal_db())).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(reopened.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.state(), AdapterState::Ready);
    }

    #[tokio::test]
    async fn close_aborts_waiting_acquisitions() {
        let locks = LockService::local();
        let adapter = {
            let conn = Connection::direct(DirectOptions::memory());
            LockedAdapter::new(AdapterOptions::new("closing"), locks.clone(), move || {
                let conn = conn.clone();
                async move { Ok(conn) }
            })
        };
        adapter.init().await.expect("init");
        let outside = locks
            .hold(&adapter.lock_name(), LockOptions::exclusive())
            .await
            .expect("outside holder");
        let waiter = {
            let adapter = adapter.clone();
            tokio::spawn(async move {
                adapter
                    .read_lock(|_ctx| async move { Ok(()) }, DbLockOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        adapter.close().await.expect("close");
        assert_eq!(waiter.await.expect("join"), Err(DbError::Closing));
        assert_eq!(
            adapter.execute("SELECT 1", &[]).await.err(),
            Some(DbError::Closing)
        );
        assert_eq!(adapter.state(), AdapterState::Closed);
        adapter.close().await.expect("double close");
        drop(outside);
    }

    #[tokio::test]
    async fn close_during_reopen_discards_the_new_connection() {
        let opened: Arc<parking_lot::Mutex<Vec<Arc<DirectConnection>>>> = Arc::default();
        let adapter = {
            let opened = opened.clone();
            LockedAdapter::new(
                AdapterOptions::new("racing").reopen_on_connection_closed(true),
                LockService::local(),
                move || {
                    let opened = opened.clone();
                    async move {
                        let later = !opened.lock().is_empty();
                        if later {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                        let direct = Arc::new(DirectConnection::new(DirectOptions::memory()));
                        opened.lock().push(direct.clone());
                        Ok(Connection::Direct(direct))
                    }
                },
            )
        };
        adapter.init().await.expect("init");
        let reopened = Arc::new(AtomicUsize::new(0));
        let _guard = {
            let reopened = reopened.clone();
            adapter.register_listener(Arc::new(move |event: &AdapterEvent| {
                if *event == AdapterEvent::DatabaseReopened {
                    reopened.fetch_add(1, Ordering::SeqCst);
                }
            }))
        };

        let reopen = adapter.reopen_internal_db();
        tokio::time::sleep(Duration::from_millis(20)).await;
        adapter.close().await.expect("close");
        assert!(reopen.await.is_err());

        assert_eq!(adapter.state(), AdapterState::Closed);
        assert_eq!(reopened.load(Ordering::SeqCst), 0);
        let opened = opened.lock().clone();
        assert_eq!(opened.len(), 2);
        for direct in opened {
            assert_eq!(direct.is_auto_commit().await, Err(DbError::Closed));
        }
        assert_eq!(
            adapter.execute("SELECT 1", &[]).await.err(),
            Some(DbError::Closing)
        );
    }

    #[tokio::test]
    async fn direct_adapter_is_not_shareable() {
        let adapter = memory_adapter("local");
        assert_eq!(
            adapter.share_connection().await.err(),
            Some(DbError::NotShareable)
        );
        adapter.refresh_schema().await.expect("noop");
    }
}
