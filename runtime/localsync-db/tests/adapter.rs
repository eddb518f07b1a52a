mod support;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use localsync_db::adapter::{AdapterEvent, AdapterOptions, DbLockOptions, LockedAdapter};
use localsync_db::connection::{
    Connection, DirectOptions, ProxiedConnection, ProxyOptions, StorageMode,
};
use localsync_db::error::DbError;
use localsync_db::locks::LockService;
use localsync_db::rpc::entry;
use localsync_db::types::SqlValue;
use localsync_db::worker::ConnectionRegistry;
use support::{Script, Step, scripted_channel};

struct Harness {
    adapter: Arc<LockedAdapter>,
    opens: Arc<AtomicUsize>,
}

fn proxied_adapter(name: &str, db: DirectOptions, script: Script) -> Harness {
    let registry = ConnectionRegistry::new();
    let opens = Arc::new(AtomicUsize::new(0));
    let adapter = {
        let opens = opens.clone();
        LockedAdapter::new(
            AdapterOptions::new(name).reopen_on_connection_closed(true),
            LockService::local(),
            move || {
                let channel = scripted_channel(registry.clone(), script.clone());
                let db = db.clone();
                let opens = opens.clone();
                async move {
                    opens.fetch_add(1, Ordering::SeqCst);
                    let proxy = ProxiedConnection::open(
                        channel,
                        db,
                        ProxyOptions::new("adapter-tests"),
                        LockService::local(),
                        None,
                    )
                    .await?;
                    Ok(Connection::Proxied(proxy))
                }
            },
        )
    };
    Harness { adapter, opens }
}

fn file_db(dir: &Path, name: &str) -> (PathBuf, DirectOptions) {
    let path = dir.join(name);
    let options = DirectOptions::file(path.display().to_string());
    (path, options)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_locks_never_overlap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, db) = file_db(dir.path(), "exclusive.db");
    let adapter = LockedAdapter::new(AdapterOptions::new("overlap"), LockService::local(), {
        let conn = Connection::direct(db);
        move || {
            let conn = conn.clone();
            async move { Ok(conn) }
        }
    });
    adapter
        .execute("CREATE TABLE counter (n INTEGER)", &[])
        .await
        .expect("schema");

    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for i in 0..8i64 {
        let adapter = adapter.clone();
        let inside = inside.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            adapter
                .write_lock(
                    |ctx| async move {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        ctx.execute("INSERT INTO counter (n) VALUES (?)", &[SqlValue::Integer(i)])
                            .await?;
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    },
                    DbLockOptions::default(),
                )
                .await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("write lock");
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let rows = adapter
        .get_all("SELECT n FROM counter", &[])
        .await
        .expect("rows");
    assert_eq!(rows.len(), 8);
}

#[tokio::test]
async fn lost_worker_is_reopened_and_the_statement_retried() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, db) = file_db(dir.path(), "retry.db");
    let failures = Arc::new(AtomicUsize::new(0));
    let script: Script = {
        let failures = failures.clone();
        Arc::new(move |entry_name: &str| {
            let fail = entry_name == entry::EXECUTE
                && failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if fail {
                Step::Fail(DbError::ConnectionClosed("worker restarted".into()))
            } else {
                Step::Forward
            }
        })
    };
    let harness = proxied_adapter("retry", db, script);
    let reopened = Arc::new(AtomicUsize::new(0));
    let _guard = {
        let reopened = reopened.clone();
        harness
            .adapter
            .register_listener(Arc::new(move |event: &AdapterEvent| {
                if matches!(event, AdapterEvent::DatabaseReopened) {
                    reopened.fetch_add(1, Ordering::SeqCst);
                }
            }))
    };
    harness
        .adapter
        .execute("CREATE TABLE notes (body TEXT)", &[])
        .await
        .expect("schema");
    assert_eq!(harness.opens.load(Ordering::SeqCst), 1);

    failures.store(1, Ordering::SeqCst);
    let inserted = harness
        .adapter
        .execute("INSERT INTO notes (body) VALUES ('survived')", &[])
        .await
        .expect("retried insert");
    assert_eq!(inserted.rows_affected, 1);
    assert_eq!(harness.opens.load(Ordering::SeqCst), 2);
    assert_eq!(reopened.load(Ordering::SeqCst), 1);

    let rows = harness
        .adapter
        .get_all("SELECT body FROM notes", &[])
        .await
        .expect("rows");
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn sql_errors_are_not_retried() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, db) = file_db(dir.path(), "sql.db");
    let harness = proxied_adapter("sql", db, Arc::new(|_: &str| Step::Forward));
    let err = harness
        .adapter
        .execute("SELECT * FROM nowhere", &[])
        .await
        .expect_err("sql error");
    assert!(matches!(err, DbError::Sql(_)));
    assert_eq!(harness.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn every_hold_is_released_through_the_worker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, db) = file_db(dir.path(), "holds.db");
    let marks = Arc::new(AtomicUsize::new(0));
    let releases = Arc::new(AtomicUsize::new(0));
    let script: Script = {
        let marks = marks.clone();
        let releases = releases.clone();
        Arc::new(move |entry_name: &str| {
            match entry_name {
                entry::MARK_HOLD => {
                    marks.fetch_add(1, Ordering::SeqCst);
                }
                entry::RELEASE_HOLD => {
                    releases.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
            Step::Forward
        })
    };
    let harness = proxied_adapter("holds", db.with_storage(StorageMode::Exclusive), script);

    let err = harness
        .adapter
        .execute("INSERT INTO missing (x) VALUES (1)", &[])
        .await
        .expect_err("missing table");
    assert!(matches!(err, DbError::Sql(_)));
    harness
        .adapter
        .read_lock(
            |ctx| async move {
                assert!(ctx.is_auto_commit().await?);
                Ok(())
            },
            DbLockOptions::default(),
        )
        .await
        .expect("read lock");

    assert_eq!(marks.load(Ordering::SeqCst), 2);
    assert_eq!(releases.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn reopen_without_a_failure_is_shared() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, db) = file_db(dir.path(), "reopen.db");
    let harness = proxied_adapter("reopen", db, Arc::new(|_: &str| Step::Forward));
    harness.adapter.init().await.expect("init");

    let first = harness.adapter.reopen_internal_db();
    let second = harness.adapter.reopen_internal_db();
    let (a, b) = tokio::join!(first, second);
    a.expect("first reopen");
    b.expect("second reopen");
    assert_eq!(harness.opens.load(Ordering::SeqCst), 2);

    harness.adapter.reopen_internal_db().await.expect("later reopen");
    assert_eq!(harness.opens.load(Ordering::SeqCst), 3);
    assert!(harness.adapter.get_all("SELECT 1 AS one", &[]).await.is_ok());
}

#[tokio::test]
async fn stalled_worker_fails_fast_once_marked_closed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (_, db) = file_db(dir.path(), "stalled.db");
    let channel = scripted_channel(
        ConnectionRegistry::new(),
        Arc::new(|entry_name: &str| {
            if entry_name == entry::EXECUTE {
                Step::Stall
            } else {
                Step::Forward
            }
        }),
    );
    let proxy = ProxiedConnection::open(
        channel,
        db,
        ProxyOptions::new("stalled").remote_can_close_unexpectedly(true),
        LockService::local(),
        None,
    )
    .await
    .expect("open");
    proxy.init().await.expect("init");

    let pending = {
        let proxy = proxy.clone();
        tokio::spawn(async move { proxy.execute("SELECT 1", &[]).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!pending.is_finished());
    proxy.mark_remote_closed();
    let outcome = tokio::time::timeout(Duration::from_millis(200), pending)
        .await
        .expect("settles after the close signal")
        .expect("join");
    assert!(matches!(outcome, Err(DbError::ConnectionClosed(_))));
    assert!(proxy.is_remote_closed());
}

#[tokio::test]
async fn closing_the_adapter_rejects_new_work() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (path, db) = file_db(dir.path(), "closing.db");
    let harness = proxied_adapter("closing", db, Arc::new(|_: &str| Step::Forward));
    harness
        .adapter
        .execute("CREATE TABLE t (x INTEGER)", &[])
        .await
        .expect("schema");
    harness.adapter.close().await.expect("close");
    assert_eq!(
        harness.adapter.execute("SELECT * FROM t", &[]).await.err(),
        Some(DbError::Closing)
    );
    assert!(path.exists());
}
