//! Raw, non-locking access to one physical database.
//!
//! [`Connection`] is a closed set of capabilities: a direct executor in this
//! process, or a proxy to a worker. Only proxies can be shared with other
//! clients or force-closed.

pub mod direct;
pub mod proxy;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{DbError, DbResult};
use crate::listeners::ListenerGuard;
use crate::types::{QueryResult, SqlValue, TableChange};

pub use direct::{DirectConnection, DirectOptions, StorageMode, TempStore};
pub use proxy::{EndpointFactory, ProxiedConnection, ProxyOptions, SharedConnectionEndpoint};

pub type ChangeListener = dyn Fn(&TableChange) + Send + Sync;

pub type OpenFuture = Pin<Box<dyn Future<Output = DbResult<Connection>> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
    Direct,
    Proxied,
}

#[derive(Clone)]
pub enum Connection {
    Direct(Arc<DirectConnection>),
    Proxied(Arc<ProxiedConnection>),
}

impl Connection {
    pub fn direct(options: DirectOptions) -> Self {
        Connection::Direct(Arc::new(DirectConnection::new(options)))
    }

    pub fn kind(&self) -> ConnectionKind {
        match self {
            Connection::Direct(_) => ConnectionKind::Direct,
            Connection::Proxied(_) => ConnectionKind::Proxied,
        }
    }

    pub fn as_proxied(&self) -> Option<&Arc<ProxiedConnection>> {
        match self {
            Connection::Proxied(proxy) => Some(proxy),
            Connection::Direct(_) => None,
        }
    }

    pub fn requires_holds(&self) -> bool {
        match self {
            Connection::Direct(conn) => conn.requires_holds(),
            Connection::Proxied(proxy) => proxy.requires_holds(),
        }
    }

    pub async fn init(&self) -> DbResult<()> {
        match self {
            Connection::Direct(conn) => conn.init().await,
            Connection::Proxied(proxy) => proxy.init().await,
        }
    }

    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<QueryResult> {
        match self {
            Connection::Direct(conn) => conn.execute(sql, params).await,
            Connection::Proxied(proxy) => proxy.execute(sql, params).await,
        }
    }

    pub async fn execute_batch(
        &self,
        sql: &str,
        param_rows: &[Vec<SqlValue>],
    ) -> DbResult<QueryResult> {
        match self {
            Connection::Direct(conn) => conn.execute_batch(sql, param_rows).await,
            Connection::Proxied(proxy) => proxy.execute_batch(sql, param_rows).await,
        }
    }

    pub fn register_change_listener(&self, listener: Arc<ChangeListener>) -> ListenerGuard {
        match self {
            Connection::Direct(conn) => conn.register_change_listener(listener),
            Connection::Proxied(proxy) => proxy.register_change_listener(listener),
        }
    }

    pub async fn mark_hold(&self) -> DbResult<String> {
        match self {
            Connection::Direct(conn) => Ok(conn.mark_hold()),
            Connection::Proxied(proxy) => proxy.mark_hold().await,
        }
    }

    pub async fn release_hold(&self, id: &str) -> DbResult<()> {
        match self {
            Connection::Direct(conn) => {
                conn.release_hold(id);
                Ok(())
            }
            Connection::Proxied(proxy) => proxy.release_hold(id).await,
        }
    }

    pub async fn is_auto_commit(&self) -> DbResult<bool> {
        match self {
            Connection::Direct(conn) => conn.is_auto_commit().await,
            Connection::Proxied(proxy) => proxy.is_auto_commit().await,
        }
    }

    pub async fn close(&self) -> DbResult<()> {
        match self {
            Connection::Direct(conn) => conn.close().await,
            Connection::Proxied(proxy) => proxy.close().await,
        }
    }

    pub async fn share_connection(&self) -> DbResult<SharedConnectionEndpoint> {
        match self {
            Connection::Direct(_) => Err(DbError::NotShareable),
            Connection::Proxied(proxy) => proxy.share_connection().await,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Direct(conn) => f.debug_tuple("Direct").field(&conn.filename()).finish(),
            Connection::Proxied(proxy) => f.debug_tuple("Proxied").field(&proxy.identifier()).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Connection, ConnectionKind, DirectOptions};
    use crate::error::DbError;

    #[tokio::test]
    async fn direct_connections_cannot_be_shared() {
        let conn = Connection::direct(DirectOptions::memory());
        assert_eq!(conn.kind(), ConnectionKind::Direct);
        assert!(conn.as_proxied().is_none());
        assert_eq!(conn.share_connection().await.err(), Some(DbError::NotShareable));
        conn.init().await.expect("init");
        let hold = conn.mark_hold().await.expect("hold");
        conn.release_hold(&hold).await.expect("release");
        assert!(!conn.requires_holds());
    }
}
