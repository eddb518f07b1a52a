//! Named locks shared by every caller that reaches the same namespace.
//!
//! Two scopes exist. [`LockScope::Process`] keeps a registry of fair
//! read/write locks inside this process. [`LockScope::System`] layers an
//! advisory lock file per name on top of that registry, so holders in other
//! processes exclude each other too, and a holder that dies releases its lock
//! with its file descriptors.
//!
//! # Invariants
//!
//! - For one name, at most one exclusive holder runs at a time; shared
//!   holders never overlap an exclusive one.
//! - Waiters inside one process are served in request order.
//! - A request that is cancelled or times out before acquisition never runs
//!   its callback and leaves no trace in the registry.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs2::FileExt;
use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::LocalSyncConfig;
use crate::error::{DbError, DbResult};

const FILE_LOCK_POLL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockMode {
    #[default]
    Exclusive,
    Shared,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockScope {
    Process,
    System,
}

#[derive(Clone, Debug, Default)]
pub struct LockOptions {
    pub mode: LockMode,
    pub cancel: Option<CancelToken>,
    pub timeout: Option<Duration>,
}

impl LockOptions {
    pub fn exclusive() -> Self {
        Self::default()
    }

    pub fn shared() -> Self {
        Self {
            mode: LockMode::Shared,
            ..Self::default()
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Handle to a lock namespace. Clones share the same registry.
#[derive(Clone)]
pub struct LockService {
    inner: Arc<LockServiceInner>,
}

struct LockServiceInner {
    scope: LockScope,
    dir: Option<PathBuf>,
    registry: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl LockService {
    /// Locks visible to this process only.
    pub fn local() -> Self {
        Self::build(LockScope::Process, None)
    }

    /// Locks visible to every process using the same `dir`.
    pub fn system(dir: impl Into<PathBuf>) -> DbResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let writable = dir.join(".localsync-dir.lock");
        let file = open_lock_file(&writable)?;
        file.try_lock_exclusive()?;
        let _ = FileExt::unlock(&file);
        Ok(Self::build(LockScope::System, Some(dir)))
    }

    /// System scope when `dir` is usable, otherwise the process-local
    /// fallback.
    pub fn detect(dir: Option<&Path>) -> Self {
        match dir {
            Some(dir) => match Self::system(dir) {
                Ok(service) => service,
                Err(err) => {
                    warn!(
                        dir = %dir.display(),
                        error = %err,
                        "lock directory unusable; multi-process guarantees degrade to single-process"
                    );
                    Self::local()
                }
            },
            None => {
                warn!("no lock directory configured; multi-process guarantees degrade to single-process");
                Self::local()
            }
        }
    }

    /// The namespace `config.lock_dir` selects, with the same fallback as
    /// [`LockService::detect`].
    pub fn from_config(config: &LocalSyncConfig) -> Self {
        Self::detect(config.lock_dir.as_deref())
    }

    fn build(scope: LockScope, dir: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(LockServiceInner {
                scope,
                dir,
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn scope(&self) -> LockScope {
        self.inner.scope
    }

    /// Acquires `name`, runs `f` and releases the lock once `f` settles.
    pub async fn request<T, F, Fut>(&self, name: &str, options: LockOptions, f: F) -> DbResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let hold = self.hold(name, options).await?;
        let out = f().await;
        hold.release();
        Ok(out)
    }

    /// Acquires `name` and keeps it until the returned guard is dropped.
    pub async fn hold(&self, name: &str, options: LockOptions) -> DbResult<LockHold> {
        if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(DbError::Cancelled);
        }
        let deadline = options.timeout.map(|limit| Instant::now() + limit);
        let entry = self.entry(name);
        let mut hold = LockHold {
            service: self.clone(),
            name: name.to_string(),
            entry: Some(entry.clone()),
            local: None,
            file: None,
        };
        hold.local = Some(match options.mode {
            LockMode::Exclusive => {
                LocalGuard::Write(race(entry.write_owned(), name, &options, deadline).await?)
            }
            LockMode::Shared => {
                LocalGuard::Read(race(entry.read_owned(), name, &options, deadline).await?)
            }
        });
        if self.inner.scope == LockScope::System {
            hold.file = Some(self.acquire_file(name, &options, deadline).await?);
        }
        debug!(lock = name, mode = ?options.mode, "lock acquired");
        Ok(hold)
    }

    /// Number of names with live holders or waiters in this process.
    pub fn active_names(&self) -> usize {
        self.inner.registry.lock().len()
    }

    fn entry(&self, name: &str) -> Arc<RwLock<()>> {
        self.inner
            .registry
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn forget_if_unused(&self, name: &str) {
        let mut registry = self.inner.registry.lock();
        if registry
            .get(name)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            registry.remove(name);
        }
    }

    async fn acquire_file(
        &self,
        name: &str,
        options: &LockOptions,
        deadline: Option<Instant>,
    ) -> DbResult<File> {
        let Some(dir) = self.inner.dir.as_ref() else {
            return Err(DbError::Config("system lock scope without a directory".into()));
        };
        let file = open_lock_file(&dir.join(lock_file_name(name)))?;
        loop {
            let attempt = match options.mode {
                LockMode::Exclusive => file.try_lock_exclusive(),
                LockMode::Shared => FileExt::try_lock_shared(&file),
            };
            match attempt {
                Ok(()) => return Ok(file),
                Err(err) if is_contended(&err) => {
                    race(sleep(FILE_LOCK_POLL), name, options, deadline).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl std::fmt::Debug for LockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockService")
            .field("scope", &self.inner.scope)
            .field("dir", &self.inner.dir)
            .finish()
    }
}

enum LocalGuard {
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
}

/// A held lock. Dropping it releases the lock.
pub struct LockHold {
    service: LockService,
    name: String,
    entry: Option<Arc<RwLock<()>>>,
    local: Option<LocalGuard>,
    file: Option<File>,
}

impl LockHold {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockHold {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
        let was_held = self.local.take().is_some();
        self.entry.take();
        self.service.forget_if_unused(&self.name);
        if was_held {
            debug!(lock = %self.name, "lock released");
        }
    }
}

impl std::fmt::Debug for LockHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHold").field("name", &self.name).finish()
    }
}

async fn race<F: Future>(
    fut: F,
    name: &str,
    options: &LockOptions,
    deadline: Option<Instant>,
) -> DbResult<F::Output> {
    let cancelled = async {
        match &options.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let timed_out = async {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancelled => Err(DbError::Cancelled),
        _ = timed_out => Err(DbError::LockTimeout(name.to_string())),
        out = fut => Ok(out),
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == fs2::lock_contended_error().kind() || err.kind() == io::ErrorKind::WouldBlock
}

fn lock_file_name(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.lock")
}
