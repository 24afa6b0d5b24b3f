//! Scripted in-process proxy for tests.
//!
//! Speaks the real codec over `tokio::io::duplex` streams. Statement results
//! are scripted by text, every request kind is counted, and failures can be
//! injected per request kind: drop the connection, answer with a server
//! error, answer with the wrong sequence number or never answer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;

use super::auth::server::check_proof;
use super::config::{Endpoint, RelayConfig};
use super::connection::Connection;
use super::error::{RelayError, RelayResult};
use super::protocol::{
    AuthRequest, CloseTarget, ColumnDescriptor, Payload, Request, RequestKind, Response,
    ResponseBody, RowValues,
};
use super::statement::count_placeholders;
use super::transport::{Connector, FramedTransport, Transport};
use super::types::Value;

pub(crate) const USER: &str = "scott";
pub(crate) const PASSWORD: &str = "tiger";
const SALT: &[u8] = b"relay-salt-0001";
const ITERATIONS: u32 = 4096;

/// Scripted outcome of executing a statement text.
#[derive(Debug, Clone)]
pub(crate) enum Script {
    Query {
        columns: Vec<ColumnDescriptor>,
        rows: Vec<RowValues>,
    },
    Update(u64),
    Fail {
        code: i32,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Read the request, then close the connection without answering
    Drop,
    /// Answer with a sequence number that matches no request
    WrongSequence,
    /// Read the request and never answer
    Stall,
}

enum Action {
    Reply(ResponseBody),
    ReplyAs(u64, ResponseBody),
    Drop,
    Stall,
}

struct ProxyState {
    password: String,
    scripts: HashMap<String, Script>,
    requests: Vec<RequestKind>,
    attempts: Vec<Endpoint>,
    refused: HashSet<Endpoint>,
    faults: Vec<(RequestKind, Fault)>,
    rejections: Vec<(RequestKind, i32, String)>,
    /// Largest batch a single fetch returns
    batch_limit: Option<usize>,
    next_id: u64,
    sessions: u32,
    prepared: Vec<String>,
    executed: Vec<(String, Vec<Value>)>,
    closed: Vec<CloseTarget>,
    autocommit: Vec<bool>,
    database: String,
    /// Backends detached by `SuspendSession`, by token
    suspended: HashMap<u64, Backend>,
    /// Where suspended sessions are offered; a non-empty socket wins
    suspend_port: u16,
    suspend_socket: String,
}

/// Per-connection proxy state.
#[derive(Default)]
struct Backend {
    statements: HashMap<u64, String>,
    cursors: HashMap<u64, FakeCursor>,
    /// Cursors kept by `SuspendResultSet`
    kept_cursors: HashSet<u64>,
    scram: Option<(String, Vec<u8>, String)>,
}

struct FakeCursor {
    columns: Vec<ColumnDescriptor>,
    affected_rows: Option<u64>,
    rows: VecDeque<RowValues>,
}

/// Handle to a scripted proxy. Clones share state.
#[derive(Clone)]
pub(crate) struct FakeProxy {
    state: Arc<Mutex<ProxyState>>,
}

impl FakeProxy {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProxyState {
                password: PASSWORD.to_string(),
                scripts: HashMap::new(),
                requests: Vec::new(),
                attempts: Vec::new(),
                refused: HashSet::new(),
                faults: Vec::new(),
                rejections: Vec::new(),
                batch_limit: None,
                next_id: 100,
                sessions: 0,
                prepared: Vec::new(),
                executed: Vec::new(),
                closed: Vec::new(),
                autocommit: Vec::new(),
                database: "main".to_string(),
                suspended: HashMap::new(),
                suspend_port: 9100,
                suspend_socket: String::new(),
            })),
        }
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            proxy: self.clone(),
        })
    }

    /// Session on this proxy with the given configuration.
    pub(crate) fn connection(&self, config: RelayConfig) -> Connection {
        Connection::with_connector(config, self.connector()).unwrap()
    }

    // ------------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------------

    pub(crate) fn script_query(&self, text: &str, columns: Vec<ColumnDescriptor>, rows: Vec<RowValues>) {
        self.state
            .lock()
            .scripts
            .insert(text.to_string(), Script::Query { columns, rows });
    }

    pub(crate) fn script_update(&self, text: &str, affected: u64) {
        self.state
            .lock()
            .scripts
            .insert(text.to_string(), Script::Update(affected));
    }

    pub(crate) fn script_failure(&self, text: &str, code: i32, message: &str) {
        self.state.lock().scripts.insert(
            text.to_string(),
            Script::Fail {
                code,
                message: message.to_string(),
            },
        );
    }

    pub(crate) fn refuse(&self, endpoint: &Endpoint) {
        self.state.lock().refused.insert(endpoint.clone());
    }

    pub(crate) fn accept(&self, endpoint: &Endpoint) {
        self.state.lock().refused.remove(endpoint);
    }

    /// Inject `fault` on the next request of `kind`.
    pub(crate) fn fault_on(&self, kind: RequestKind, fault: Fault) {
        self.state.lock().faults.push((kind, fault));
    }

    /// Answer the next request of `kind` with a server error.
    pub(crate) fn reject_on(&self, kind: RequestKind, code: i32, message: &str) {
        self.state
            .lock()
            .rejections
            .push((kind, code, message.to_string()));
    }

    pub(crate) fn set_batch_limit(&self, limit: usize) {
        self.state.lock().batch_limit = Some(limit);
    }

    pub(crate) fn set_password(&self, password: &str) {
        self.state.lock().password = password.to_string();
    }

    /// Offer suspended sessions on a Unix socket instead of a TCP port.
    pub(crate) fn set_suspend_socket(&self, path: &str) {
        self.state.lock().suspend_socket = path.to_string();
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub(crate) fn requests(&self) -> Vec<RequestKind> {
        self.state.lock().requests.clone()
    }

    pub(crate) fn count(&self, kind: RequestKind) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|k| **k == kind)
            .count()
    }

    pub(crate) fn attempts(&self) -> Vec<Endpoint> {
        self.state.lock().attempts.clone()
    }

    /// Connections that completed the transport setup.
    pub(crate) fn sessions(&self) -> u32 {
        self.state.lock().sessions
    }

    pub(crate) fn prepared(&self) -> Vec<String> {
        self.state.lock().prepared.clone()
    }

    pub(crate) fn executed(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().executed.clone()
    }

    pub(crate) fn closed(&self) -> Vec<CloseTarget> {
        self.state.lock().closed.clone()
    }

    pub(crate) fn autocommit_log(&self) -> Vec<bool> {
        self.state.lock().autocommit.clone()
    }

    // ------------------------------------------------------------------------
    // Serving
    // ------------------------------------------------------------------------

    async fn serve(self, stream: DuplexStream) {
        let mut transport = FramedTransport::new(stream);
        let mut backend = Backend::default();

        loop {
            let Ok(frame) = transport.recv_frame().await else {
                break;
            };
            let Ok((sequence, request)) = Request::decode(frame) else {
                break;
            };
            let (sequence, body) = match self.handle(&mut backend, request) {
                Action::Reply(body) => (sequence, body),
                Action::ReplyAs(sequence, body) => (sequence, body),
                Action::Drop => break,
                Action::Stall => continue,
            };
            let Ok(frame) = (Response { sequence, body }).encode() else {
                break;
            };
            if transport.send_frame(&frame).await.is_err() {
                break;
            }
        }
        transport.close().await;
    }

    fn handle(&self, backend: &mut Backend, request: Request) -> Action {
        let mut state = self.state.lock();
        let kind = request.kind();
        state.requests.push(kind);

        let mut wrong_sequence = false;
        if let Some(pos) = state.faults.iter().position(|(k, _)| *k == kind) {
            let (_, fault) = state.faults.remove(pos);
            match fault {
                Fault::Drop => return Action::Drop,
                Fault::Stall => return Action::Stall,
                Fault::WrongSequence => wrong_sequence = true,
            }
        }
        if let Some(pos) = state.rejections.iter().position(|(k, _, _)| *k == kind) {
            let (_, code, message) = state.rejections.remove(pos);
            return Action::Reply(ResponseBody::ServerError { code, message });
        }

        let body = state.respond(backend, request);
        if wrong_sequence {
            return Action::ReplyAs(u64::MAX, body);
        }
        Action::Reply(body)
    }
}

impl ProxyState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn respond(&mut self, backend: &mut Backend, request: Request) -> ResponseBody {
        let payload = match request {
            Request::Authenticate { user, auth, .. } => match auth {
                AuthRequest::Plain { password } => {
                    if user != USER || password != self.password {
                        return auth_failed("invalid credentials");
                    }
                    self.auth_ok(Vec::new())
                }
                AuthRequest::Scram { client_first } => {
                    let text = String::from_utf8_lossy(&client_first).to_string();
                    let Some((_, client_nonce)) = text.split_once(",r=") else {
                        return auth_failed("malformed client-first message");
                    };
                    let nonce = format!("{}fakeproxy", client_nonce);
                    backend.scram = Some((user, client_first, nonce.clone()));
                    Payload::AuthChallenge {
                        nonce,
                        salt: SALT.to_vec(),
                        iterations: ITERATIONS,
                    }
                }
            },
            Request::AuthProof { client_final } => {
                let Some((user, client_first, nonce)) = backend.scram.take() else {
                    return auth_failed("unexpected proof");
                };
                match check_proof(
                    &user,
                    &self.password,
                    &client_first,
                    &nonce,
                    SALT,
                    ITERATIONS,
                    &client_final,
                ) {
                    Some(signature) if user == USER => self.auth_ok(signature),
                    _ => return auth_failed("invalid proof"),
                }
            }
            Request::Prepare { text } => {
                let id = self.next_id();
                let param_count = count_placeholders(&text) as u32;
                self.prepared.push(text.clone());
                backend.statements.insert(id, text);
                Payload::Prepared {
                    statement_id: id,
                    param_count,
                }
            }
            Request::BindAndExecute {
                statement_id,
                params,
            } => {
                let Some(text) = backend.statements.get(&statement_id).cloned() else {
                    return server_error(404, "unknown statement");
                };
                self.executed.push((text.clone(), params));
                let script = self.scripts.get(&text).cloned().unwrap_or(Script::Update(1));
                let cursor_id = self.next_id();
                let cursor = match script {
                    Script::Query { columns, rows } => FakeCursor {
                        columns,
                        affected_rows: None,
                        rows: rows.into(),
                    },
                    Script::Update(affected) => FakeCursor {
                        columns: Vec::new(),
                        affected_rows: Some(affected),
                        rows: VecDeque::new(),
                    },
                    Script::Fail { code, message } => return server_error(code, &message),
                };
                let executed = cursor.executed(cursor_id);
                backend.cursors.insert(cursor_id, cursor);
                executed
            }
            Request::Fetch {
                cursor_id,
                max_rows,
            } => {
                let limit = self.batch_limit;
                let Some(remaining) = backend.cursors.get_mut(&cursor_id).map(|c| &mut c.rows) else {
                    return server_error(404, "unknown cursor");
                };
                let mut take = if max_rows == 0 {
                    remaining.len()
                } else {
                    remaining.len().min(max_rows as usize)
                };
                if let Some(limit) = limit {
                    take = take.min(limit);
                }
                let rows = remaining.drain(..take).collect();
                Payload::Rows {
                    rows,
                    end_of_results: remaining.is_empty(),
                }
            }
            Request::Close { target } => {
                match target {
                    CloseTarget::Statement(id) => {
                        backend.statements.remove(&id);
                    }
                    CloseTarget::Cursor(id) => {
                        backend.cursors.remove(&id);
                        backend.kept_cursors.remove(&id);
                    }
                    CloseTarget::Session => {}
                }
                self.closed.push(target);
                Payload::Ack
            }
            Request::SetAutocommit { on } => {
                self.autocommit.push(on);
                Payload::Ack
            }
            Request::Commit
            | Request::Rollback
            | Request::Ping
            | Request::Savepoint { .. }
            | Request::RollbackToSavepoint { .. }
            | Request::ReleaseSavepoint { .. } => Payload::Ack,
            Request::Identify => Payload::Text("fakedb".to_string()),
            Request::DbVersion => Payload::Text("1.0".to_string()),
            Request::ServerVersion => Payload::Text("fake-proxy 0.1".to_string()),
            Request::SelectDatabase { name } => {
                self.database = name;
                Payload::Ack
            }
            Request::CurrentDatabase => Payload::Text(self.database.clone()),
            Request::LastInsertId => Payload::Integer(42),
            Request::SuspendSession => {
                let token = self.next_id();
                self.suspended.insert(token, std::mem::take(backend));
                Payload::Suspended {
                    token,
                    port: self.suspend_port,
                    socket: self.suspend_socket.clone(),
                }
            }
            Request::ResumeSession { token } => {
                let Some(saved) = self.suspended.remove(&token) else {
                    return auth_failed("no suspended session with that token");
                };
                *backend = saved;
                self.auth_ok(Vec::new())
            }
            Request::SuspendResultSet { cursor_id } => {
                if !backend.cursors.contains_key(&cursor_id) {
                    return server_error(404, "unknown cursor");
                }
                backend.kept_cursors.insert(cursor_id);
                Payload::Ack
            }
            Request::ResumeResultSet { cursor_id } => {
                let Some(cursor) = backend
                    .cursors
                    .get(&cursor_id)
                    .filter(|_| backend.kept_cursors.contains(&cursor_id))
                else {
                    return server_error(404, "no suspended result set with that id");
                };
                cursor.executed(cursor_id)
            }
        };
        ResponseBody::Ok(payload)
    }

    fn auth_ok(&mut self, server_signature: Vec<u8>) -> Payload {
        Payload::AuthOk {
            server_signature,
            session_info: format!("fake-proxy session {}", self.sessions),
        }
    }
}

impl FakeCursor {
    fn executed(&self, cursor_id: u64) -> Payload {
        Payload::Executed {
            cursor_id,
            affected_rows: self.affected_rows,
            columns: self.columns.clone(),
        }
    }
}

fn auth_failed(message: &str) -> ResponseBody {
    ResponseBody::AuthFailed {
        message: message.to_string(),
    }
}

fn server_error(code: i32, message: &str) -> ResponseBody {
    ResponseBody::ServerError {
        code,
        message: message.to_string(),
    }
}

/// Connector that records attempts and serves them from a [`FakeProxy`].
struct FakeConnector {
    proxy: FakeProxy,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, endpoint: &Endpoint, _timeout: Duration) -> RelayResult<Box<dyn Transport>> {
        {
            let mut state = self.proxy.state.lock();
            state.attempts.push(endpoint.clone());
            if state.refused.contains(endpoint) {
                return Err(RelayError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("{} refused the connection", endpoint),
                )));
            }
            state.sessions += 1;
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(self.proxy.clone().serve(server));
        Ok(Box::new(FramedTransport::new(client)))
    }
}

// ============================================================================
// Test fixtures
// ============================================================================

pub(crate) fn endpoint_a() -> Endpoint {
    Endpoint::tcp("proxy-a", 9000)
}

pub(crate) fn endpoint_b() -> Endpoint {
    Endpoint::tcp("proxy-b", 9001)
}

/// Credentials matching the fake proxy, one endpoint, short timeouts.
pub(crate) fn test_config() -> RelayConfig {
    RelayConfig::new(USER, PASSWORD)
        .endpoint(endpoint_a())
        .io_timeout(Duration::from_secs(5))
        .connect_timeout(Duration::from_secs(5))
}
