//! Shared, lock-disciplined database access for many clients of one local
//! SQLite store, plus the coordinator that multiplexes those clients onto a
//! single database connection and sync session.

pub mod adapter;
pub mod cancel;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod listeners;
pub mod locks;
pub mod logging;
pub mod rpc;
pub mod sync;
pub mod types;
pub mod worker;

pub use adapter::{AdapterEvent, AdapterOptions, AdapterState, DbLockOptions, LockContext, LockedAdapter, Transaction};
pub use cancel::CancelToken;
pub use config::{ConfigError, LocalSyncConfig};
pub use connection::{Connection, DirectOptions, ProxiedConnection, ProxyOptions, StorageMode};
pub use coordinator::{ClientProvider, SharedCoordinator, TabClient, WrappedPort};
pub use error::{DbError, DbResult};
pub use locks::{LockMode, LockOptions, LockScope, LockService};
pub use types::{QueryResult, Row, SqlValue, TableChange};
pub use worker::{ConnectionRegistry, WorkerHost};
