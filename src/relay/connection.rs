//! The public engine facade.
//!
//! A [`Connection`] is one logical application connection. It is cheap to
//! clone; clones share the session. The link (transport, sequence counter,
//! prepared statements) is serialized behind an async mutex, while handle
//! tables and transaction state sit behind a short synchronous lock that is
//! never held across an `.await`.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

use super::config::{Endpoint, RelayConfig};
use super::cursor::{validate_row, CursorEntry, QueryResult, Row, RowStream, SharedColumns};
use super::error::{RelayError, RelayResult};
use super::handles::{CursorHandle, HandleTable, StatementHandle};
use super::protocol::{CloseTarget, Payload, Request, RequestKind, MAX_COUNT};
use super::session::{Link, SessionState, SuspendedSession};
use super::statement::StatementEntry;
use super::transaction::TransactionState;
use super::transport::{Connector, SocketConnector};
use super::types::Value;

/// Session state guarded by the synchronous lock.
pub(crate) struct Shared {
    pub(crate) closed: bool,
    pub(crate) statements: HandleTable<StatementEntry>,
    pub(crate) cursors: HandleTable<CursorEntry>,
    pub(crate) txn: TransactionState,
}

pub(crate) struct Inner {
    id: Uuid,
    config: Arc<RelayConfig>,
    pub(crate) link: tokio::sync::Mutex<Link>,
    pub(crate) shared: Mutex<Shared>,
}

/// A logical connection to the proxy.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Create a session without connecting. The first call that needs the
    /// proxy connects.
    pub fn new(config: RelayConfig) -> RelayResult<Self> {
        Self::with_connector(config, Arc::new(SocketConnector))
    }

    /// Create a session that opens transports through `connector`.
    pub fn with_connector(config: RelayConfig, connector: Arc<dyn Connector>) -> RelayResult<Self> {
        config.validate()?;
        let id = Uuid::new_v4();
        let config = Arc::new(config);
        let link = Link::new(Arc::clone(&config), connector);

        log::debug!("session {} created for {:?}", id, config.endpoints);
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                config,
                link: tokio::sync::Mutex::new(link),
                shared: Mutex::new(Shared {
                    closed: false,
                    statements: HandleTable::new(id, "statement"),
                    cursors: HandleTable::new(id, "cursor"),
                    txn: TransactionState::default(),
                }),
            }),
        })
    }

    /// Create a session and connect immediately.
    pub async fn connect(config: RelayConfig) -> RelayResult<Self> {
        let connection = Self::new(config)?;
        connection.ensure_connected().await?;
        Ok(connection)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.lock().closed
    }

    pub async fn state(&self) -> SessionState {
        self.inner.link.lock().await.state()
    }

    /// Endpoint of the current link, if connected.
    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.inner.link.lock().await.endpoint().cloned()
    }

    /// Session description reported by the proxy at authentication.
    pub async fn session_info(&self) -> Option<String> {
        self.inner.link.lock().await.session_info().map(str::to_string)
    }

    /// Connect now if not already connected.
    pub async fn ensure_connected(&self) -> RelayResult<()> {
        self.live_link().await.map(|_| ())
    }

    // ------------------------------------------------------------------------
    // Internal plumbing
    // ------------------------------------------------------------------------

    /// Lock the synchronous state, failing if the session is closed.
    pub(crate) fn shared(&self) -> RelayResult<MutexGuard<'_, Shared>> {
        let shared = self.inner.shared.lock();
        if shared.closed {
            return Err(RelayError::SessionClosed);
        }
        Ok(shared)
    }

    /// Lock the link and make sure it is connected.
    pub(crate) async fn live_link(&self) -> RelayResult<tokio::sync::MutexGuard<'_, Link>> {
        let mut link = self.inner.link.lock().await;
        let autocommit = self.shared()?.txn.autocommit;
        link.ensure_live(autocommit).await?;
        self.inner.shared.lock().txn.observe_epoch(link.epoch());
        Ok(link)
    }

    /// Round trip that records a lost transaction when the link drops.
    pub(crate) async fn call(&self, link: &mut Link, request: &Request) -> RelayResult<Payload> {
        let result = link.round_trip(request).await;
        if let Err(e) = &result {
            if e.is_transport() {
                self.inner.shared.lock().txn.link_lost();
            }
        }
        result
    }

    /// Round trip expecting a bare acknowledgement.
    pub(crate) async fn call_ack(&self, link: &mut Link, request: &Request) -> RelayResult<()> {
        match self.call(link, request).await? {
            Payload::Ack => Ok(()),
            other => Err(link.unexpected(other, request.kind()).await),
        }
    }

    // ------------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------------

    /// Register a statement. Local only; nothing is sent until execution.
    pub fn prepare(&self, text: &str) -> RelayResult<StatementHandle> {
        let entry = StatementEntry::new(text);
        let mut shared = self.shared()?;
        log::debug!("statement with {} placeholder(s) registered", entry.param_count);
        Ok(StatementHandle(shared.statements.insert(entry)))
    }

    /// Number of bind values `statement` expects.
    pub fn param_count(&self, statement: StatementHandle) -> RelayResult<usize> {
        Ok(self.shared()?.statements.get(&statement.0)?.param_count)
    }

    /// Zero-based bind position of `key` in `statement`.
    ///
    /// `key` is a placeholder name with or without its `:`, `$` or `@`
    /// prefix, or a 1-based position such as `"2"`.
    pub fn bind_index(&self, statement: StatementHandle, key: &str) -> RelayResult<usize> {
        self.shared()?
            .statements
            .get(&statement.0)?
            .placeholders
            .position(key)
            .ok_or_else(|| RelayError::NoSuchBind(key.to_string()))
    }

    /// Execute with values bound by placeholder name. Binding a name twice
    /// keeps the last value; every placeholder must be bound.
    pub async fn execute_named<K: AsRef<str>>(
        &self,
        statement: StatementHandle,
        binds: Vec<(K, Value)>,
    ) -> RelayResult<CursorHandle> {
        let expected = self.param_count(statement)?;
        let mut slots: Vec<Option<Value>> = vec![None; expected];
        for (key, value) in binds {
            let index = self.bind_index(statement, key.as_ref())?;
            slots[index] = Some(value);
        }
        let values = complete_binds(slots)?;
        self.execute(statement, values).await
    }

    /// Bind `binds` and execute, returning a cursor positioned before the
    /// first row. Any previous cursor of the statement is invalidated.
    pub async fn execute(&self, statement: StatementHandle, binds: Vec<Value>) -> RelayResult<CursorHandle> {
        let (text, param_count) = {
            let shared = self.shared()?;
            let entry = shared.statements.get(&statement.0)?;
            if binds.len() != entry.param_count {
                return Err(RelayError::BindArity {
                    expected: entry.param_count,
                    actual: binds.len(),
                });
            }
            if binds.len() > MAX_COUNT {
                return Err(RelayError::LimitExceeded {
                    what: "bind values",
                    actual: binds.len(),
                    max: MAX_COUNT,
                });
            }
            shared.txn.check_usable()?;
            (Arc::clone(&entry.text), entry.param_count)
        };

        let mut link = self.live_link().await?;
        // Reconnecting may have just lost the transaction
        self.shared()?.txn.check_usable()?;

        let statement_id = self
            .server_statement(&mut link, statement, &text, param_count)
            .await?;
        let request = Request::BindAndExecute {
            statement_id,
            params: binds,
        };
        let (cursor_id, affected_rows, columns) = match self.call(&mut link, &request).await? {
            Payload::Executed {
                cursor_id,
                affected_rows,
                columns,
            } => (cursor_id, affected_rows, columns),
            other => return Err(link.unexpected(other, RequestKind::BindAndExecute).await),
        };
        let epoch = link.epoch();

        // Registered while the link is still held
        let mut shared = self.shared()?;
        let previous = shared.statements.get(&statement.0)?.cursor;
        if let Some(previous) = previous {
            shared.cursors.remove(&previous.0);
        }
        let cursor = CursorHandle(shared.cursors.insert(CursorEntry {
            statement: Some(statement),
            server_id: cursor_id,
            epoch,
            columns: Arc::new(columns),
            affected_rows,
            exhausted: false,
        }));
        shared.statements.get_mut(&statement.0)?.cursor = Some(cursor);
        if !shared.txn.autocommit {
            shared.txn.record_execution(epoch);
        }
        drop(shared);
        drop(link);
        Ok(cursor)
    }

    /// Server id of `statement` on the current link, preparing it if needed.
    async fn server_statement(
        &self,
        link: &mut Link,
        statement: StatementHandle,
        text: &str,
        param_count: usize,
    ) -> RelayResult<u64> {
        if let Some(id) = link.prepared.get(&statement) {
            return Ok(id);
        }

        let request = Request::Prepare {
            text: text.to_string(),
        };
        let (id, server_count) = match self.call(link, &request).await? {
            Payload::Prepared {
                statement_id,
                param_count,
            } => (statement_id, param_count),
            other => return Err(link.unexpected(other, RequestKind::Prepare).await),
        };
        if server_count as usize != param_count {
            log::warn!(
                "proxy reports {} parameter(s), statement text has {}",
                server_count,
                param_count
            );
        }
        log::debug!("prepared statement as {} on link epoch {}", id, link.epoch());

        if let Some(evicted) = link.prepared.insert(statement, id) {
            log::debug!("releasing evicted prepared statement {}", evicted);
            link.notify(&Request::Close {
                target: CloseTarget::Statement(evicted),
            })
            .await;
        }
        Ok(id)
    }

    /// Prepare, execute and drain `text` in one call.
    pub async fn execute_once(&self, text: &str, binds: Vec<Value>) -> RelayResult<QueryResult> {
        let statement = self.prepare(text)?;
        let result = self.run_to_end(statement, binds).await;
        self.close_statement(statement).await;
        result
    }

    async fn run_to_end(&self, statement: StatementHandle, binds: Vec<Value>) -> RelayResult<QueryResult> {
        let cursor = self.execute(statement, binds).await?;
        let rows = self.rows(cursor).try_collect().await?;
        Ok(QueryResult {
            columns: self.columns(cursor)?,
            affected_rows: self.affected_rows(cursor)?,
            rows,
        })
    }

    /// Close a statement and its cursor. Idempotent.
    pub async fn close_statement(&self, statement: StatementHandle) {
        {
            let Ok(mut shared) = self.shared() else {
                return;
            };
            let Some(entry) = shared.statements.remove(&statement.0) else {
                return;
            };
            if let Some(cursor) = entry.cursor {
                shared.cursors.remove(&cursor.0);
            }
        }

        let mut link = self.inner.link.lock().await;
        if let Some(server_id) = link.prepared.remove(&statement) {
            link.notify(&Request::Close {
                target: CloseTarget::Statement(server_id),
            })
            .await;
        }
    }

    // ------------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------------

    /// Fetch up to `max_rows` rows (`0` = all remaining).
    ///
    /// Returns fewer rows than asked for only when the cursor is exhausted.
    pub async fn fetch(&self, cursor: CursorHandle, max_rows: u32) -> RelayResult<Vec<Row>> {
        let (server_id, epoch, columns) = {
            let shared = self.shared()?;
            let entry = shared.cursors.get(&cursor.0)?;
            if entry.exhausted {
                return Ok(Vec::new());
            }
            (entry.server_id, entry.epoch, Arc::clone(&entry.columns))
        };

        let mut link = self.inner.link.lock().await;
        if !link.is_ready() || link.epoch() != epoch {
            // The backend holding the result is gone
            return Err(RelayError::StaleHandle("cursor"));
        }

        let mut rows = Vec::new();
        let exhausted = loop {
            let want = if max_rows == 0 {
                0
            } else {
                max_rows - rows.len() as u32
            };
            let request = Request::Fetch {
                cursor_id: server_id,
                max_rows: want,
            };
            let (batch, end) = match self.call(&mut link, &request).await? {
                Payload::Rows {
                    rows,
                    end_of_results,
                } => (rows, end_of_results),
                other => return Err(link.unexpected(other, RequestKind::Fetch).await),
            };
            if (want != 0 && batch.len() > want as usize) || (batch.is_empty() && !end) {
                link.disconnect().await;
                return Err(RelayError::protocol(format!(
                    "proxy sent {} row(s) for a fetch of {} without ending the result",
                    batch.len(),
                    want
                )));
            }

            for values in batch {
                validate_row(&columns, &values)?;
                rows.push(Row::new(Arc::clone(&columns), values));
            }
            if end {
                break true;
            }
            if max_rows != 0 && rows.len() >= max_rows as usize {
                break false;
            }
        };
        drop(link);

        if exhausted {
            if let Ok(entry) = self.shared()?.cursors.get_mut(&cursor.0) {
                entry.exhausted = true;
            }
        }
        log::debug!("fetched {} row(s), exhausted: {}", rows.len(), exhausted);
        Ok(rows)
    }

    /// Lazy row sequence over `cursor`, fetching `fetch_size` rows at a time.
    pub fn rows(&self, cursor: CursorHandle) -> RowStream {
        self.rows_with_batch(cursor, self.inner.config.fetch_size)
    }

    /// Lazy row sequence fetching `batch` rows at a time (`0` = one fetch of
    /// everything).
    pub fn rows_with_batch(&self, cursor: CursorHandle, batch: u32) -> RowStream {
        RowStream::new(self.clone(), cursor, batch)
    }

    pub fn columns(&self, cursor: CursorHandle) -> RelayResult<SharedColumns> {
        Ok(Arc::clone(&self.shared()?.cursors.get(&cursor.0)?.columns))
    }

    pub fn affected_rows(&self, cursor: CursorHandle) -> RelayResult<Option<u64>> {
        Ok(self.shared()?.cursors.get(&cursor.0)?.affected_rows)
    }

    /// Close a cursor. Idempotent; failures to notify the proxy are logged.
    pub async fn close_cursor(&self, cursor: CursorHandle) {
        let entry = {
            let Ok(mut shared) = self.shared() else {
                return;
            };
            let Some(entry) = shared.cursors.remove(&cursor.0) else {
                return;
            };
            detach_cursor(&mut shared, entry.statement, cursor);
            entry
        };

        let mut link = self.inner.link.lock().await;
        if link.epoch() == entry.epoch {
            link.notify(&Request::Close {
                target: CloseTarget::Cursor(entry.server_id),
            })
            .await;
        }
    }

    /// Server-side id of `cursor`'s result set.
    pub fn result_set_id(&self, cursor: CursorHandle) -> RelayResult<u64> {
        Ok(self.shared()?.cursors.get(&cursor.0)?.server_id)
    }

    /// Ask the proxy to keep `cursor`'s result set after this session lets go
    /// of it, and return its id for [`Connection::resume_result_set`]. The
    /// local handle is released.
    pub async fn suspend_result_set(&self, cursor: CursorHandle) -> RelayResult<u64> {
        let (server_id, epoch) = {
            let shared = self.shared()?;
            let entry = shared.cursors.get(&cursor.0)?;
            (entry.server_id, entry.epoch)
        };

        let mut link = self.inner.link.lock().await;
        if !link.is_ready() || link.epoch() != epoch {
            return Err(RelayError::StaleHandle("cursor"));
        }
        let request = Request::SuspendResultSet {
            cursor_id: server_id,
        };
        self.call_ack(&mut link, &request).await?;

        let mut shared = self.shared()?;
        if let Some(entry) = shared.cursors.remove(&cursor.0) {
            detach_cursor(&mut shared, entry.statement, cursor);
        }
        log::debug!("result set {} suspended", server_id);
        Ok(server_id)
    }

    /// Reattach to a result set suspended on the current backend. Fetching
    /// continues where the suspending cursor stopped.
    pub async fn resume_result_set(&self, id: u64) -> RelayResult<CursorHandle> {
        let mut link = self.live_link().await?;
        let request = Request::ResumeResultSet { cursor_id: id };
        let (cursor_id, affected_rows, columns) = match self.call(&mut link, &request).await? {
            Payload::Executed {
                cursor_id,
                affected_rows,
                columns,
            } => (cursor_id, affected_rows, columns),
            other => return Err(link.unexpected(other, RequestKind::ResumeResultSet).await),
        };

        let mut shared = self.shared()?;
        let cursor = CursorHandle(shared.cursors.insert(CursorEntry {
            statement: None,
            server_id: cursor_id,
            epoch: link.epoch(),
            columns: Arc::new(columns),
            affected_rows,
            exhausted: false,
        }));
        log::debug!("result set {} resumed", cursor_id);
        Ok(cursor)
    }

    // ------------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------------

    /// Detach from the backend while the proxy keeps it, with its open
    /// transaction and result sets, for [`Connection::resume_session`].
    ///
    /// Any other call made before resuming connects to a fresh backend and
    /// abandons the suspended one.
    pub async fn suspend_session(&self) -> RelayResult<SuspendedSession> {
        let mut link = self.live_link().await?;
        match self.call(&mut link, &Request::SuspendSession).await? {
            Payload::Suspended {
                token,
                port,
                socket,
            } => Ok(link.detach_suspended(token, port, &socket).await),
            other => Err(link.unexpected(other, RequestKind::SuspendSession).await),
        }
    }

    /// Reattach to a suspended backend, either this session's own or one
    /// handed over by another client.
    pub async fn resume_session(&self, session: &SuspendedSession) -> RelayResult<()> {
        let mut link = self.inner.link.lock().await;
        let autocommit = self.shared()?.txn.autocommit;
        link.resume(session, autocommit).await?;
        self.inner.shared.lock().txn.observe_epoch(link.epoch());
        Ok(())
    }

    /// TCP port of the suspended backend, if this session is suspended.
    pub async fn connection_port(&self) -> Option<u16> {
        self.inner.link.lock().await.suspended().and_then(SuspendedSession::port)
    }

    /// Unix socket of the suspended backend, if this session is suspended.
    pub async fn connection_socket(&self) -> Option<String> {
        self.inner.link.lock().await.suspended().and_then(SuspendedSession::socket)
    }

    /// Close the session. Uncommitted work is rolled back first. Idempotent.
    pub async fn close(&self) {
        let dirty = {
            let mut shared = self.inner.shared.lock();
            if shared.closed {
                return;
            }
            shared.closed = true;
            shared.statements.clear();
            shared.cursors.clear();
            shared.txn.is_dirty() && !shared.txn.is_lost()
        };

        let mut link = self.inner.link.lock().await;
        if dirty {
            log::info!("rolling back uncommitted work before close");
            link.notify(&Request::Rollback).await;
        }
        link.close().await;
        drop(link);

        self.inner.shared.lock().txn.settle();
        log::info!("session {} closed", self.inner.id);
    }

    /// Round-trip a no-op request, connecting if needed.
    pub async fn ping(&self) -> RelayResult<()> {
        let mut link = self.live_link().await?;
        self.call_ack(&mut link, &Request::Ping).await
    }

    /// Backend type behind the proxy.
    pub async fn identify(&self) -> RelayResult<String> {
        self.request_text(Request::Identify).await
    }

    pub async fn db_version(&self) -> RelayResult<String> {
        self.request_text(Request::DbVersion).await
    }

    pub async fn server_version(&self) -> RelayResult<String> {
        self.request_text(Request::ServerVersion).await
    }

    pub async fn current_database(&self) -> RelayResult<String> {
        self.request_text(Request::CurrentDatabase).await
    }

    pub async fn select_database(&self, name: &str) -> RelayResult<()> {
        let mut link = self.live_link().await?;
        let request = Request::SelectDatabase {
            name: name.to_string(),
        };
        self.call_ack(&mut link, &request).await
    }

    /// Id generated by the most recent insert on this session's backend.
    pub async fn last_insert_id(&self) -> RelayResult<i64> {
        let mut link = self.live_link().await?;
        match self.call(&mut link, &Request::LastInsertId).await? {
            Payload::Integer(id) => Ok(id),
            other => Err(link.unexpected(other, RequestKind::LastInsertId).await),
        }
    }

    async fn request_text(&self, request: Request) -> RelayResult<String> {
        let mut link = self.live_link().await?;
        match self.call(&mut link, &request).await? {
            Payload::Text(text) => Ok(text),
            other => Err(link.unexpected(other, request.kind()).await),
        }
    }
}

/// Forget `cursor` as the latest result of `statement`.
fn detach_cursor(shared: &mut Shared, statement: Option<StatementHandle>, cursor: CursorHandle) {
    let Some(statement) = statement else {
        return;
    };
    if let Ok(entry) = shared.statements.get_mut(&statement.0) {
        if entry.cursor == Some(cursor) {
            entry.cursor = None;
        }
    }
}

/// Unwrap bound slots, failing on the first gap.
pub(crate) fn complete_binds(slots: Vec<Option<Value>>) -> RelayResult<Vec<Value>> {
    let expected = slots.len();
    let actual = slots.iter().filter(|slot| slot.is_some()).count();
    if actual != expected {
        return Err(RelayError::BindArity { expected, actual });
    }
    Ok(slots.into_iter().flatten().collect())
}
