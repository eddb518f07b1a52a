//! Error type shared by every layer of the crate.

use thiserror::Error;

pub type DbResult<T> = Result<T, DbError>;

/// Failure reported by connections, the adapter and the coordinator.
///
/// Errors are `Clone` so a single fatal outcome (a failed initialization, a
/// failed re-open) can be handed to every caller waiting on it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DbError {
    #[error("failed to open database after {attempts} attempts: {message}")]
    InitFailed { attempts: u32, message: String },
    /// The backing connection or worker went away. Recoverable by re-opening.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),
    /// The SQL engine rejected a statement. Never retried.
    #[error("sql error: {0}")]
    Sql(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("timed out waiting for lock `{0}`")]
    LockTimeout(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("cannot acquire lock, closing")]
    Closing,
    #[error("database connection is closed")]
    Closed,
    #[error("database has not been initialized")]
    NotInitialized,
    #[error("result set is empty")]
    EmptyResult,
    #[error("only worker-backed connections can be shared")]
    NotShareable,
    /// A relayed call lost its target tab before it answered.
    #[error("relay target disappeared: {0}")]
    RelayTargetGone(String),
    #[error("no connected client can serve {0}")]
    NoClient(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    /// An error status the local side does not recognise.
    #[error("remote error ({status}): {message}")]
    Remote { status: String, message: String },
    #[error("io error: {0}")]
    Io(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DbError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, DbError::ConnectionClosed(_))
    }

    /// True for errors produced by an abort signal or an elapsed lock timer.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            DbError::Cancelled | DbError::LockTimeout(_) | DbError::Timeout(_)
        )
    }

    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        DbError::ConnectionClosed(reason.into())
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        DbError::Sql(err.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::Io(err.to_string())
    }
}
