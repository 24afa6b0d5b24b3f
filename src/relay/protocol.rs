//! Relay wire protocol message encoding and decoding.
//!
//! Frame payload layouts (all integers big-endian, strings and byte
//! sequences `u32` length-prefixed):
//!
//! ```text
//! request  := kind:u8  sequence:u64  payload
//! response := sequence:u64  status:u8  (result-tag:u8 result | error)
//! ```
//!
//! The frame length prefix itself is owned by the transport. Both directions
//! are encodable and decodable; the proxy side is only used by tests.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;

use super::error::{RelayError, RelayResult};
use super::types::{
    get_bytes, get_i32, get_i64, get_string, get_u32, get_u64, get_u8, put_bytes, TypeTag, Value,
};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Largest frame payload either side will accept.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Most bind values, columns or row values a message can carry.
pub const MAX_COUNT: usize = u16::MAX as usize;

/// `affected_rows` value meaning "not reported".
const NO_AFFECTED_ROWS: i64 = -1;

/// Values of a single row, inline for rows up to 16 columns.
pub type RowValues = SmallVec<[Value; 16]>;

/// Request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestKind {
    Authenticate = 1,
    AuthProof = 2,
    Prepare = 3,
    BindAndExecute = 4,
    Fetch = 5,
    Commit = 6,
    Rollback = 7,
    Ping = 8,
    Close = 9,
    SetAutocommit = 10,
    Savepoint = 11,
    RollbackToSavepoint = 12,
    ReleaseSavepoint = 13,
    Identify = 14,
    DbVersion = 15,
    ServerVersion = 16,
    SelectDatabase = 17,
    CurrentDatabase = 18,
    LastInsertId = 19,
    SuspendSession = 20,
    ResumeSession = 21,
    SuspendResultSet = 22,
    ResumeResultSet = 23,
}

impl RequestKind {
    pub fn from_u8(b: u8) -> RelayResult<Self> {
        use RequestKind::*;
        Ok(match b {
            1 => Authenticate,
            2 => AuthProof,
            3 => Prepare,
            4 => BindAndExecute,
            5 => Fetch,
            6 => Commit,
            7 => Rollback,
            8 => Ping,
            9 => Close,
            10 => SetAutocommit,
            11 => Savepoint,
            12 => RollbackToSavepoint,
            13 => ReleaseSavepoint,
            14 => Identify,
            15 => DbVersion,
            16 => ServerVersion,
            17 => SelectDatabase,
            18 => CurrentDatabase,
            19 => LastInsertId,
            20 => SuspendSession,
            21 => ResumeSession,
            22 => SuspendResultSet,
            23 => ResumeResultSet,
            _ => return Err(RelayError::protocol(format!("unknown request kind: {}", b))),
        })
    }
}

// ============================================================================
// Requests (Client -> Proxy)
// ============================================================================

/// Credentials carried by `Authenticate`.
#[derive(Clone, PartialEq)]
pub enum AuthRequest {
    /// Password sent as-is.
    Plain { password: String },
    /// SCRAM-SHA-256 client-first message.
    Scram { client_first: Vec<u8> },
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthRequest::Plain { .. } => f.write_str("Plain { password: <redacted> }"),
            AuthRequest::Scram { .. } => f.write_str("Scram { .. }"),
        }
    }
}

/// What a `Close` request releases on the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTarget {
    Statement(u64),
    Cursor(u64),
    Session,
}

/// A request sent to the proxy.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Authenticate {
        user: String,
        client_info: String,
        auth: AuthRequest,
    },
    AuthProof {
        client_final: Vec<u8>,
    },
    Prepare {
        text: String,
    },
    BindAndExecute {
        statement_id: u64,
        params: Vec<Value>,
    },
    /// `max_rows == 0` asks for every remaining row.
    Fetch {
        cursor_id: u64,
        max_rows: u32,
    },
    Commit,
    Rollback,
    Ping,
    Close {
        target: CloseTarget,
    },
    SetAutocommit {
        on: bool,
    },
    Savepoint {
        name: String,
    },
    RollbackToSavepoint {
        name: String,
    },
    ReleaseSavepoint {
        name: String,
    },
    Identify,
    DbVersion,
    ServerVersion,
    SelectDatabase {
        name: String,
    },
    CurrentDatabase,
    LastInsertId,
    /// Hold the backend for a later `ResumeSession` on a new transport.
    SuspendSession,
    /// First request on a transport reattaching to a held backend.
    ResumeSession {
        token: u64,
    },
    /// Keep a result set open across a session suspension.
    SuspendResultSet {
        cursor_id: u64,
    },
    /// Reattach to a suspended result set; answered with `Executed`.
    ResumeResultSet {
        cursor_id: u64,
    },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Authenticate { .. } => RequestKind::Authenticate,
            Request::AuthProof { .. } => RequestKind::AuthProof,
            Request::Prepare { .. } => RequestKind::Prepare,
            Request::BindAndExecute { .. } => RequestKind::BindAndExecute,
            Request::Fetch { .. } => RequestKind::Fetch,
            Request::Commit => RequestKind::Commit,
            Request::Rollback => RequestKind::Rollback,
            Request::Ping => RequestKind::Ping,
            Request::Close { .. } => RequestKind::Close,
            Request::SetAutocommit { .. } => RequestKind::SetAutocommit,
            Request::Savepoint { .. } => RequestKind::Savepoint,
            Request::RollbackToSavepoint { .. } => RequestKind::RollbackToSavepoint,
            Request::ReleaseSavepoint { .. } => RequestKind::ReleaseSavepoint,
            Request::Identify => RequestKind::Identify,
            Request::DbVersion => RequestKind::DbVersion,
            Request::ServerVersion => RequestKind::ServerVersion,
            Request::SelectDatabase { .. } => RequestKind::SelectDatabase,
            Request::CurrentDatabase => RequestKind::CurrentDatabase,
            Request::LastInsertId => RequestKind::LastInsertId,
            Request::SuspendSession => RequestKind::SuspendSession,
            Request::ResumeSession { .. } => RequestKind::ResumeSession,
            Request::SuspendResultSet { .. } => RequestKind::SuspendResultSet,
            Request::ResumeResultSet { .. } => RequestKind::ResumeResultSet,
        }
    }

    /// Encode the request into a frame payload.
    ///
    /// Fails with [`RelayError::LimitExceeded`] when a count or the frame
    /// itself does not fit the wire format.
    pub fn encode(&self, sequence: u64) -> RelayResult<BytesMut> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.kind() as u8);
        buf.put_u64(sequence);

        match self {
            Request::Authenticate {
                user,
                client_info,
                auth,
            } => {
                put_bytes(&mut buf, user.as_bytes());
                put_bytes(&mut buf, client_info.as_bytes());
                match auth {
                    AuthRequest::Plain { password } => {
                        buf.put_u8(0);
                        put_bytes(&mut buf, password.as_bytes());
                    }
                    AuthRequest::Scram { client_first } => {
                        buf.put_u8(1);
                        put_bytes(&mut buf, client_first);
                    }
                }
            }
            Request::AuthProof { client_final } => put_bytes(&mut buf, client_final),
            Request::Prepare { text } => put_bytes(&mut buf, text.as_bytes()),
            Request::BindAndExecute {
                statement_id,
                params,
            } => {
                buf.put_u64(*statement_id);
                put_count(&mut buf, params.len(), "bind values")?;
                for param in params {
                    param.encode(&mut buf);
                }
            }
            Request::Fetch {
                cursor_id,
                max_rows,
            } => {
                buf.put_u64(*cursor_id);
                buf.put_u32(*max_rows);
            }
            Request::Close { target } => match target {
                CloseTarget::Statement(id) => {
                    buf.put_u8(0);
                    buf.put_u64(*id);
                }
                CloseTarget::Cursor(id) => {
                    buf.put_u8(1);
                    buf.put_u64(*id);
                }
                CloseTarget::Session => buf.put_u8(2),
            },
            Request::SetAutocommit { on } => buf.put_u8(u8::from(*on)),
            Request::ResumeSession { token } => buf.put_u64(*token),
            Request::SuspendResultSet { cursor_id } | Request::ResumeResultSet { cursor_id } => {
                buf.put_u64(*cursor_id)
            }
            Request::Savepoint { name }
            | Request::RollbackToSavepoint { name }
            | Request::ReleaseSavepoint { name }
            | Request::SelectDatabase { name } => put_bytes(&mut buf, name.as_bytes()),
            Request::Commit
            | Request::Rollback
            | Request::Ping
            | Request::Identify
            | Request::DbVersion
            | Request::ServerVersion
            | Request::CurrentDatabase
            | Request::LastInsertId
            | Request::SuspendSession => {}
        }

        check_frame_len(&buf)?;
        Ok(buf)
    }

    /// Decode a request frame payload, returning its sequence number.
    pub fn decode(mut frame: Bytes) -> RelayResult<(u64, Request)> {
        let kind = RequestKind::from_u8(get_u8(&mut frame)?)?;
        let sequence = get_u64(&mut frame)?;
        let buf = &mut frame;

        let request = match kind {
            RequestKind::Authenticate => {
                let user = get_string(buf)?;
                let client_info = get_string(buf)?;
                let auth = match get_u8(buf)? {
                    0 => AuthRequest::Plain {
                        password: get_string(buf)?,
                    },
                    1 => AuthRequest::Scram {
                        client_first: get_bytes(buf)?.to_vec(),
                    },
                    m => {
                        return Err(RelayError::protocol(format!(
                            "unknown auth mechanism: {}",
                            m
                        )))
                    }
                };
                Request::Authenticate {
                    user,
                    client_info,
                    auth,
                }
            }
            RequestKind::AuthProof => Request::AuthProof {
                client_final: get_bytes(buf)?.to_vec(),
            },
            RequestKind::Prepare => Request::Prepare {
                text: get_string(buf)?,
            },
            RequestKind::BindAndExecute => {
                let statement_id = get_u64(buf)?;
                let count = get_count(buf)?;
                let mut params = Vec::with_capacity(count);
                for _ in 0..count {
                    params.push(Value::decode(buf)?);
                }
                Request::BindAndExecute {
                    statement_id,
                    params,
                }
            }
            RequestKind::Fetch => Request::Fetch {
                cursor_id: get_u64(buf)?,
                max_rows: get_u32(buf)?,
            },
            RequestKind::Commit => Request::Commit,
            RequestKind::Rollback => Request::Rollback,
            RequestKind::Ping => Request::Ping,
            RequestKind::Close => {
                let target = match get_u8(buf)? {
                    0 => CloseTarget::Statement(get_u64(buf)?),
                    1 => CloseTarget::Cursor(get_u64(buf)?),
                    2 => CloseTarget::Session,
                    t => return Err(RelayError::protocol(format!("unknown close target: {}", t))),
                };
                Request::Close { target }
            }
            RequestKind::SetAutocommit => Request::SetAutocommit {
                on: get_u8(buf)? != 0,
            },
            RequestKind::Savepoint => Request::Savepoint {
                name: get_string(buf)?,
            },
            RequestKind::RollbackToSavepoint => Request::RollbackToSavepoint {
                name: get_string(buf)?,
            },
            RequestKind::ReleaseSavepoint => Request::ReleaseSavepoint {
                name: get_string(buf)?,
            },
            RequestKind::Identify => Request::Identify,
            RequestKind::DbVersion => Request::DbVersion,
            RequestKind::ServerVersion => Request::ServerVersion,
            RequestKind::SelectDatabase => Request::SelectDatabase {
                name: get_string(buf)?,
            },
            RequestKind::CurrentDatabase => Request::CurrentDatabase,
            RequestKind::LastInsertId => Request::LastInsertId,
            RequestKind::SuspendSession => Request::SuspendSession,
            RequestKind::ResumeSession => Request::ResumeSession {
                token: get_u64(buf)?,
            },
            RequestKind::SuspendResultSet => Request::SuspendResultSet {
                cursor_id: get_u64(buf)?,
            },
            RequestKind::ResumeResultSet => Request::ResumeResultSet {
                cursor_id: get_u64(buf)?,
            },
        };

        expect_end(buf)?;
        Ok((sequence, request))
    }
}

// ============================================================================
// Responses (Proxy -> Client)
// ============================================================================

/// Column descriptor returned at execute time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub type_tag: TypeTag,
    pub nullable: bool,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, type_tag: TypeTag, nullable: bool) -> Self {
        Self {
            name: name.into(),
            type_tag,
            nullable,
        }
    }
}

/// Result payload of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Ack,
    AuthChallenge {
        nonce: String,
        salt: Vec<u8>,
        iterations: u32,
    },
    AuthOk {
        server_signature: Vec<u8>,
        session_info: String,
    },
    Prepared {
        statement_id: u64,
        param_count: u32,
    },
    Executed {
        cursor_id: u64,
        affected_rows: Option<u64>,
        columns: Vec<ColumnDescriptor>,
    },
    Rows {
        rows: Vec<RowValues>,
        end_of_results: bool,
    },
    Text(String),
    Integer(i64),
    /// Backend held for resumption. `socket` is empty when the proxy only
    /// listens on TCP.
    Suspended {
        token: u64,
        port: u16,
        socket: String,
    },
}

impl Payload {
    fn tag(&self) -> u8 {
        match self {
            Payload::Ack => 0,
            Payload::AuthChallenge { .. } => 1,
            Payload::AuthOk { .. } => 2,
            Payload::Prepared { .. } => 3,
            Payload::Executed { .. } => 4,
            Payload::Rows { .. } => 5,
            Payload::Text(_) => 6,
            Payload::Integer(_) => 7,
            Payload::Suspended { .. } => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Payload::Ack => "Ack",
            Payload::AuthChallenge { .. } => "AuthChallenge",
            Payload::AuthOk { .. } => "AuthOk",
            Payload::Prepared { .. } => "Prepared",
            Payload::Executed { .. } => "Executed",
            Payload::Rows { .. } => "Rows",
            Payload::Text(_) => "Text",
            Payload::Integer(_) => "Integer",
            Payload::Suspended { .. } => "Suspended",
        }
    }

    /// Error for a payload that does not answer the request it was matched to.
    pub fn unexpected(&self, request: RequestKind) -> RelayError {
        RelayError::protocol(format!(
            "unexpected {} payload in response to {:?}",
            self.name(),
            request
        ))
    }
}

/// Response status with its body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Ok(Payload),
    ServerError { code: i32, message: String },
    AuthFailed { message: String },
}

/// A response frame from the proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub sequence: u64,
    pub body: ResponseBody,
}

impl Response {
    pub fn ok(sequence: u64, payload: Payload) -> Self {
        Self {
            sequence,
            body: ResponseBody::Ok(payload),
        }
    }

    pub fn encode(&self) -> RelayResult<BytesMut> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u64(self.sequence);

        match &self.body {
            ResponseBody::Ok(payload) => {
                buf.put_u8(0);
                buf.put_u8(payload.tag());
                encode_payload(&mut buf, payload)?;
            }
            ResponseBody::ServerError { code, message } => {
                buf.put_u8(1);
                buf.put_i32(*code);
                put_bytes(&mut buf, message.as_bytes());
            }
            ResponseBody::AuthFailed { message } => {
                buf.put_u8(2);
                put_bytes(&mut buf, message.as_bytes());
            }
        }

        check_frame_len(&buf)?;
        Ok(buf)
    }

    pub fn decode(mut frame: Bytes) -> RelayResult<Self> {
        let buf = &mut frame;
        let sequence = get_u64(buf)?;
        let body = match get_u8(buf)? {
            0 => ResponseBody::Ok(decode_payload(buf)?),
            1 => ResponseBody::ServerError {
                code: get_i32(buf)?,
                message: get_string(buf)?,
            },
            2 => ResponseBody::AuthFailed {
                message: get_string(buf)?,
            },
            s => return Err(RelayError::protocol(format!("unknown status code: {}", s))),
        };
        expect_end(buf)?;
        Ok(Self { sequence, body })
    }
}

fn encode_payload(buf: &mut BytesMut, payload: &Payload) -> RelayResult<()> {
    match payload {
        Payload::Ack => {}
        Payload::AuthChallenge {
            nonce,
            salt,
            iterations,
        } => {
            put_bytes(buf, nonce.as_bytes());
            put_bytes(buf, salt);
            buf.put_u32(*iterations);
        }
        Payload::AuthOk {
            server_signature,
            session_info,
        } => {
            put_bytes(buf, server_signature);
            put_bytes(buf, session_info.as_bytes());
        }
        Payload::Prepared {
            statement_id,
            param_count,
        } => {
            buf.put_u64(*statement_id);
            buf.put_u32(*param_count);
        }
        Payload::Executed {
            cursor_id,
            affected_rows,
            columns,
        } => {
            buf.put_u64(*cursor_id);
            buf.put_i64(
                affected_rows
                    .and_then(|n| i64::try_from(n).ok())
                    .unwrap_or(NO_AFFECTED_ROWS),
            );
            put_count(buf, columns.len(), "columns")?;
            for column in columns {
                put_bytes(buf, column.name.as_bytes());
                buf.put_u8(column.type_tag as u8);
                buf.put_u8(u8::from(column.nullable));
            }
        }
        Payload::Rows {
            rows,
            end_of_results,
        } => {
            buf.put_u8(u8::from(*end_of_results));
            let row_count = u32::try_from(rows.len()).map_err(|_| RelayError::LimitExceeded {
                what: "rows",
                actual: rows.len(),
                max: u32::MAX as usize,
            })?;
            buf.put_u32(row_count);
            for row in rows {
                put_count(buf, row.len(), "row values")?;
                for value in row {
                    value.encode(buf);
                }
            }
        }
        Payload::Text(text) => put_bytes(buf, text.as_bytes()),
        Payload::Integer(v) => buf.put_i64(*v),
        Payload::Suspended {
            token,
            port,
            socket,
        } => {
            buf.put_u64(*token);
            buf.put_u16(*port);
            put_bytes(buf, socket.as_bytes());
        }
    }
    Ok(())
}

fn decode_payload(buf: &mut Bytes) -> RelayResult<Payload> {
    match get_u8(buf)? {
        0 => Ok(Payload::Ack),
        1 => Ok(Payload::AuthChallenge {
            nonce: get_string(buf)?,
            salt: get_bytes(buf)?.to_vec(),
            iterations: get_u32(buf)?,
        }),
        2 => Ok(Payload::AuthOk {
            server_signature: get_bytes(buf)?.to_vec(),
            session_info: get_string(buf)?,
        }),
        3 => Ok(Payload::Prepared {
            statement_id: get_u64(buf)?,
            param_count: get_u32(buf)?,
        }),
        4 => {
            let cursor_id = get_u64(buf)?;
            let affected = get_i64(buf)?;
            let count = get_count(buf)?;
            let mut columns = Vec::with_capacity(count);
            for _ in 0..count {
                let name = get_string(buf)?;
                let type_tag = TypeTag::from_u8(get_u8(buf)?)?;
                if type_tag == TypeTag::Null {
                    return Err(RelayError::protocol(format!(
                        "column {} declared with null type",
                        name
                    )));
                }
                let nullable = get_u8(buf)? != 0;
                columns.push(ColumnDescriptor {
                    name,
                    type_tag,
                    nullable,
                });
            }
            Ok(Payload::Executed {
                cursor_id,
                affected_rows: u64::try_from(affected).ok(),
                columns,
            })
        }
        5 => {
            let end_of_results = get_u8(buf)? != 0;
            let row_count = get_u32(buf)? as usize;
            // Every row needs at least its column count.
            if row_count > buf.remaining() / 2 {
                return Err(RelayError::protocol(format!(
                    "row count {} exceeds frame size",
                    row_count
                )));
            }
            let mut rows = Vec::with_capacity(row_count);
            for _ in 0..row_count {
                let cols = get_count(buf)?;
                let mut row = RowValues::with_capacity(cols);
                for _ in 0..cols {
                    row.push(Value::decode(buf)?);
                }
                rows.push(row);
            }
            Ok(Payload::Rows {
                rows,
                end_of_results,
            })
        }
        6 => Ok(Payload::Text(get_string(buf)?)),
        7 => Ok(Payload::Integer(get_i64(buf)?)),
        8 => Ok(Payload::Suspended {
            token: get_u64(buf)?,
            port: get_count(buf)? as u16,
            socket: get_string(buf)?,
        }),
        t => Err(RelayError::protocol(format!("unknown result payload: {}", t))),
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn put_count(buf: &mut BytesMut, count: usize, what: &'static str) -> RelayResult<()> {
    let count = u16::try_from(count).map_err(|_| RelayError::LimitExceeded {
        what,
        actual: count,
        max: MAX_COUNT,
    })?;
    buf.put_u16(count);
    Ok(())
}

fn check_frame_len(buf: &BytesMut) -> RelayResult<()> {
    if buf.len() > MAX_FRAME_LEN {
        return Err(RelayError::LimitExceeded {
            what: "frame bytes",
            actual: buf.len(),
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

fn get_count(buf: &mut Bytes) -> RelayResult<usize> {
    if buf.remaining() < 2 {
        return Err(RelayError::protocol("truncated count"));
    }
    Ok(buf.get_u16() as usize)
}

fn expect_end(buf: &Bytes) -> RelayResult<()> {
    if buf.has_remaining() {
        return Err(RelayError::protocol(format!(
            "{} trailing byte(s) after message",
            buf.remaining()
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use smallvec::smallvec;

    fn request_roundtrip(request: &Request) -> Request {
        let frame = request.encode(99).unwrap().freeze();
        let (sequence, decoded) = Request::decode(frame).unwrap();
        assert_eq!(sequence, 99);
        decoded
    }

    fn payload_roundtrip(payload: Payload) -> Payload {
        let frame = Response::ok(5, payload).encode().unwrap().freeze();
        match Response::decode(frame).unwrap().body {
            ResponseBody::Ok(payload) => payload,
            other => panic!("expected Ok body, got {:?}", other),
        }
    }

    fn protocol_error<T: fmt::Debug>(result: RelayResult<T>) -> String {
        match result {
            Err(RelayError::Protocol(msg)) => msg,
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    fn with_sequence(sequence: u64, tail: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64(sequence);
        buf.put_slice(tail);
        buf.freeze()
    }

    #[test]
    fn test_request_header_layout() {
        let encoded = Request::Ping.encode(7).unwrap();
        assert_eq!(encoded[0], RequestKind::Ping as u8);
        assert_eq!(&encoded[1..9], &7u64.to_be_bytes());
        assert_eq!(encoded.len(), 9);
    }

    #[test]
    fn test_response_header_layout() {
        let encoded = Response::ok(42, Payload::Ack).encode().unwrap();
        assert_eq!(&encoded[0..8], &42u64.to_be_bytes());
        assert_eq!(encoded[8], 0);
        assert_eq!(encoded[9], 0);
    }

    #[test]
    fn test_plain_password_is_redacted_in_debug() {
        let req = Request::Authenticate {
            user: "scott".to_string(),
            client_info: String::new(),
            auth: AuthRequest::Plain {
                password: "tiger".to_string(),
            },
        };
        let dbg = format!("{:?}", req);
        assert!(dbg.contains("scott"));
        assert!(!dbg.contains("tiger"));
    }

    #[test]
    fn test_every_request_survives_the_codec() {
        let moment = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_opt(23, 59, 59)
            .unwrap();
        let requests = vec![
            Request::Authenticate {
                user: "scott".to_string(),
                client_info: "relaykit test".to_string(),
                auth: AuthRequest::Plain {
                    password: "tiger".to_string(),
                },
            },
            Request::Authenticate {
                user: "scott".to_string(),
                client_info: String::new(),
                auth: AuthRequest::Scram {
                    client_first: b"n,,n=scott,r=abc".to_vec(),
                },
            },
            Request::AuthProof {
                client_final: vec![0, 1, 2, 255],
            },
            Request::Prepare {
                text: "select * from t where a = ?".to_string(),
            },
            Request::BindAndExecute {
                statement_id: 17,
                params: vec![
                    Value::Null,
                    Value::Integer(-5),
                    Value::Float(2.5),
                    Value::String("x\0y".to_string()),
                    Value::Bytes(vec![0, 0, 7]),
                    Value::DateTime(moment),
                    Value::Bool(true),
                ],
            },
            Request::Fetch {
                cursor_id: 3,
                max_rows: 0,
            },
            Request::Commit,
            Request::Rollback,
            Request::Ping,
            Request::Close {
                target: CloseTarget::Statement(1),
            },
            Request::Close {
                target: CloseTarget::Cursor(2),
            },
            Request::Close {
                target: CloseTarget::Session,
            },
            Request::SetAutocommit { on: false },
            Request::Savepoint {
                name: "sp1".to_string(),
            },
            Request::RollbackToSavepoint {
                name: "sp1".to_string(),
            },
            Request::ReleaseSavepoint {
                name: "sp1".to_string(),
            },
            Request::Identify,
            Request::DbVersion,
            Request::ServerVersion,
            Request::SelectDatabase {
                name: "reports".to_string(),
            },
            Request::CurrentDatabase,
            Request::LastInsertId,
            Request::SuspendSession,
            Request::ResumeSession { token: u64::MAX },
            Request::SuspendResultSet { cursor_id: 8 },
            Request::ResumeResultSet { cursor_id: 8 },
        ];
        for request in &requests {
            assert_eq!(&request_roundtrip(request), request);
        }
    }

    #[test]
    fn test_every_payload_survives_the_codec() {
        let payloads = vec![
            Payload::Ack,
            Payload::AuthChallenge {
                nonce: "abcdef".to_string(),
                salt: vec![1, 2, 3],
                iterations: 4096,
            },
            Payload::AuthOk {
                server_signature: vec![9; 32],
                session_info: "backend 1".to_string(),
            },
            Payload::Prepared {
                statement_id: 11,
                param_count: 2,
            },
            Payload::Executed {
                cursor_id: 12,
                affected_rows: None,
                columns: vec![
                    ColumnDescriptor::new("id", TypeTag::Integer, false),
                    ColumnDescriptor::new("blob", TypeTag::Bytes, true),
                ],
            },
            Payload::Executed {
                cursor_id: 13,
                affected_rows: Some(0),
                columns: Vec::new(),
            },
            Payload::Rows {
                rows: vec![
                    smallvec![Value::Integer(1), Value::Bytes(vec![0, 0xff, 0])],
                    smallvec![Value::Null, Value::String("nul\0inside".to_string())],
                ],
                end_of_results: true,
            },
            Payload::Rows {
                rows: Vec::new(),
                end_of_results: false,
            },
            Payload::Text("fakedb".to_string()),
            Payload::Integer(i64::MIN),
            Payload::Suspended {
                token: 77,
                port: 9100,
                socket: "/tmp/relay.sock".to_string(),
            },
        ];
        for payload in payloads {
            assert_eq!(payload_roundtrip(payload.clone()), payload);
        }
    }

    #[test]
    fn test_error_bodies_survive_the_codec() {
        for body in [
            ResponseBody::ServerError {
                code: -1,
                message: "deadlock".to_string(),
            },
            ResponseBody::AuthFailed {
                message: "bad password".to_string(),
            },
        ] {
            let response = Response { sequence: 3, body };
            let frame = response.encode().unwrap().freeze();
            assert_eq!(Response::decode(frame).unwrap(), response);
        }
    }

    #[test]
    fn test_unknown_status_code() {
        let msg = protocol_error(Response::decode(with_sequence(1, &[9])));
        assert!(msg.contains("status"));
    }

    #[test]
    fn test_unknown_request_kind() {
        let mut buf = BytesMut::new();
        buf.put_u8(200);
        buf.put_u64(1);
        let msg = protocol_error(Request::decode(buf.freeze()));
        assert!(msg.contains("request kind"));
    }

    #[test]
    fn test_unknown_payload_tag() {
        let msg = protocol_error(Response::decode(with_sequence(1, &[0, 99])));
        assert!(msg.contains("payload"));
    }

    #[test]
    fn test_unknown_close_target() {
        let mut buf = BytesMut::new();
        buf.put_u8(RequestKind::Close as u8);
        buf.put_u64(1);
        buf.put_u8(7);
        let msg = protocol_error(Request::decode(buf.freeze()));
        assert!(msg.contains("close target"));
    }

    #[test]
    fn test_unknown_auth_mechanism() {
        let mut buf = BytesMut::new();
        buf.put_u8(RequestKind::Authenticate as u8);
        buf.put_u64(1);
        put_bytes(&mut buf, b"scott");
        put_bytes(&mut buf, b"");
        buf.put_u8(5);
        protocol_error(Request::decode(buf.freeze()));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut request = Request::Ping.encode(1).unwrap();
        request.put_u8(0);
        let msg = protocol_error(Request::decode(request.freeze()));
        assert!(msg.contains("trailing"));

        let mut response = Response::ok(1, Payload::Integer(4)).encode().unwrap();
        response.put_slice(&[1, 2]);
        let msg = protocol_error(Response::decode(response.freeze()));
        assert!(msg.contains("2 trailing"));
    }

    #[test]
    fn test_truncated_response_rejected() {
        let full = Response::ok(1, Payload::Text("hello".to_string()))
            .encode()
            .unwrap()
            .freeze();
        protocol_error(Response::decode(full.slice(..full.len() - 1)));
        protocol_error(Response::decode(full.slice(..4)));
    }

    #[test]
    fn test_row_count_larger_than_frame_rejected() {
        let mut tail = vec![0, 5, 1];
        tail.extend_from_slice(&u32::MAX.to_be_bytes());
        let msg = protocol_error(Response::decode(with_sequence(1, &tail)));
        assert!(msg.contains("row count"));
    }

    #[test]
    fn test_column_with_null_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u64(1);
        buf.put_u8(0);
        buf.put_u8(4);
        buf.put_u64(12);
        buf.put_i64(-1);
        buf.put_u16(1);
        put_bytes(&mut buf, b"c");
        buf.put_u8(TypeTag::Null as u8);
        buf.put_u8(1);
        protocol_error(Response::decode(buf.freeze()));
    }

    #[test]
    fn test_bind_count_limit() {
        let at_limit = Request::BindAndExecute {
            statement_id: 1,
            params: vec![Value::Null; MAX_COUNT],
        };
        assert!(at_limit.encode(1).is_ok());

        let over = Request::BindAndExecute {
            statement_id: 1,
            params: vec![Value::Null; MAX_COUNT + 1],
        };
        match over.encode(1) {
            Err(RelayError::LimitExceeded { what, actual, max }) => {
                assert_eq!(what, "bind values");
                assert_eq!(actual, MAX_COUNT + 1);
                assert_eq!(max, MAX_COUNT);
            }
            other => panic!("expected limit error, got {:?}", other),
        }
    }

    #[test]
    fn test_row_width_limit() {
        let wide: RowValues = std::iter::repeat(Value::Null).take(MAX_COUNT + 1).collect();
        let response = Response::ok(
            1,
            Payload::Rows {
                rows: vec![wide],
                end_of_results: true,
            },
        );
        assert!(matches!(
            response.encode(),
            Err(RelayError::LimitExceeded { what: "row values", .. })
        ));
    }
}
