//! Error taxonomy for the relay engine.
//!
//! Every failure carries a machine-readable [`ErrorKind`] so the adapter layer
//! can decide retry-vs-abort without inspecting message text.

use std::io;

use thiserror::Error;

use super::types::TypeTag;

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Coarse classification of a [`RelayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connect,
    AuthFailed,
    Io,
    Protocol,
    BindArity,
    TypeMismatch,
    NoSuchColumn,
    NoSuchBind,
    LimitExceeded,
    Exec,
    AmbiguousOutcome,
    AutoCommitSwitch,
    NotInTransaction,
    TransactionLost,
    StaleHandle,
    SessionClosed,
    Unsupported,
    Config,
}

/// Errors produced by the relay engine.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Every configured endpoint attempt failed.
    #[error("could not connect to proxy after {attempts} attempt(s): {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: Box<RelayError>,
    },

    /// The proxy rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Transport failure while talking to the proxy.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The proxy closed the stream.
    #[error("connection closed by proxy")]
    Closed,

    /// Malformed or unrecognized frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Bind count does not match the statement's placeholders.
    #[error("statement expects {expected} bind value(s), got {actual}")]
    BindArity { expected: usize, actual: usize },

    /// A value's type tag does not match the declared column type.
    #[error("type mismatch in column {column}: expected {expected}, found {actual}")]
    TypeMismatch {
        column: usize,
        expected: TypeTag,
        actual: String,
    },

    /// A row accessor named a column the result does not have.
    #[error("no such column: {0}")]
    NoSuchColumn(String),

    /// A bind name matches no placeholder of the statement.
    #[error("statement has no placeholder named {0:?}")]
    NoSuchBind(String),

    /// A count does not fit the wire format.
    #[error("too many {what}: {actual} (at most {max})")]
    LimitExceeded {
        what: &'static str,
        actual: usize,
        max: usize,
    },

    /// The server reported a clean failure for a statement.
    #[error("server error {code}: {message}")]
    Exec { code: i32, message: String },

    /// A commit or rollback was sent but its outcome is unknown.
    #[error("outcome of {operation} is unknown: {source}")]
    AmbiguousOutcome {
        operation: &'static str,
        #[source]
        source: Box<RelayError>,
    },

    /// The implicit commit before enabling autocommit failed.
    #[error("could not enable autocommit, implicit commit failed: {0}")]
    AutoCommitSwitch(#[source] Box<RelayError>),

    /// A transaction-scoped call was made in autocommit mode.
    #[error("{0} requires autocommit to be off")]
    NotInTransaction(&'static str),

    /// The link dropped while uncommitted work was pending.
    #[error("transaction with {pending} pending operation(s) was lost with its connection; roll back to continue")]
    TransactionLost { pending: u32 },

    /// A statement or cursor handle is closed, invalidated or foreign.
    #[error("stale {0} handle")]
    StaleHandle(&'static str),

    /// The session was explicitly closed.
    #[error("session is closed")]
    SessionClosed,

    /// The operation is not provided by this client.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        RelayError::Protocol(msg.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Connect { .. } => ErrorKind::Connect,
            RelayError::AuthFailed(_) => ErrorKind::AuthFailed,
            RelayError::Io(_) | RelayError::Closed => ErrorKind::Io,
            RelayError::Protocol(_) => ErrorKind::Protocol,
            RelayError::BindArity { .. } => ErrorKind::BindArity,
            RelayError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            RelayError::NoSuchColumn(_) => ErrorKind::NoSuchColumn,
            RelayError::NoSuchBind(_) => ErrorKind::NoSuchBind,
            RelayError::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            RelayError::Exec { .. } => ErrorKind::Exec,
            RelayError::AmbiguousOutcome { .. } => ErrorKind::AmbiguousOutcome,
            RelayError::AutoCommitSwitch(_) => ErrorKind::AutoCommitSwitch,
            RelayError::NotInTransaction(_) => ErrorKind::NotInTransaction,
            RelayError::TransactionLost { .. } => ErrorKind::TransactionLost,
            RelayError::StaleHandle(_) => ErrorKind::StaleHandle,
            RelayError::SessionClosed => ErrorKind::SessionClosed,
            RelayError::Unsupported(_) => ErrorKind::Unsupported,
            RelayError::Config(_) => ErrorKind::Config,
        }
    }

    /// Failures that invalidate the current transport.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_) | RelayError::Closed | RelayError::Protocol(_)
        )
    }

    /// Validation failures raised before any network traffic.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            RelayError::BindArity { .. }
                | RelayError::TypeMismatch { .. }
                | RelayError::NoSuchColumn(_)
                | RelayError::NoSuchBind(_)
                | RelayError::LimitExceeded { .. }
                | RelayError::NotInTransaction(_)
                | RelayError::TransactionLost { .. }
                | RelayError::StaleHandle(_)
                | RelayError::SessionClosed
                | RelayError::Unsupported(_)
                | RelayError::Config(_)
        )
    }

    /// Hint for the caller: whether re-issuing the same operation is safe.
    ///
    /// The engine itself never retries application operations.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Exec { .. } | RelayError::Connect { .. } => true,
            RelayError::Io(_) | RelayError::Closed => true,
            RelayError::AutoCommitSwitch(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    /// Server error code, if the proxy reported one.
    pub fn server_code(&self) -> Option<i32> {
        match self {
            RelayError::Exec { code, .. } => Some(*code),
            RelayError::AutoCommitSwitch(inner) => inner.server_code(),
            _ => None,
        }
    }
}
