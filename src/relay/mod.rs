//! SQL relay client engine.
//!
//! This module talks to a remote relay proxy that pools real database
//! connections. It provides:
//! - Endpoint failover with bounded retry
//! - A length-prefixed binary protocol with explicit value types
//! - Server-side prepared statements with per-link re-preparation
//! - Forward-only cursors with batched fetch
//! - Transaction tracking that never loses a commit silently
//!
//! Architecture:
//! - `transport`: framed byte stream and connectors
//! - `protocol`: request/response encoding and decoding
//! - `types`: typed bind and column values
//! - `session`: link state machine, retry loop and handshake
//! - `auth`: SCRAM-SHA-256 client
//! - `statement`, `cursor`, `handles`: statement and cursor lifecycle
//! - `transaction`: commit/rollback/autocommit coordination
//! - `connection`: the public [`Connection`] facade
//! - `config`: endpoints and session options
//! - `error`: error taxonomy

pub mod auth;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod handles;
pub mod protocol;
pub mod session;
pub mod statement;
pub mod transaction;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod fake_proxy;

pub use config::{AuthMethod, Endpoint, RelayConfig};
pub use connection::Connection;
pub use cursor::{FromValue, QueryResult, Row, RowStream, SharedColumns};
pub use error::{ErrorKind, RelayError, RelayResult};
pub use handles::{CursorHandle, StatementHandle};
pub use protocol::ColumnDescriptor;
pub use session::{SessionState, SuspendedSession};
pub use statement::count_placeholders;
pub use transport::{Connector, FramedTransport, SocketConnector, Transport};
pub use types::{TypeTag, Value};
