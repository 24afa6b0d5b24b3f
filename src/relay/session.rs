//! Session link management.
//!
//! The [`Link`] owns the current transport, the request sequence counter and
//! the statements prepared on the current backend. It connects lazily, cycles
//! through the configured endpoints on failure, and drops the transport on
//! any transport-class error so the next caller reconnects.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::auth::ScramClient;
use super::config::{AuthMethod, Endpoint, RelayConfig};
use super::error::{RelayError, RelayResult};
use super::protocol::{
    AuthRequest, CloseTarget, Payload, Request, RequestKind, Response, ResponseBody,
};
use super::statement::PreparedCache;
use super::transport::{with_timeout, Connector, Transport};

/// Link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    /// Terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// A session detached from its transport that another client (or this one,
/// later) can reattach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendedSession {
    token: u64,
    endpoint: Endpoint,
}

impl SuspendedSession {
    pub fn new(token: u64, endpoint: Endpoint) -> Self {
        Self { token, endpoint }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Where the suspended backend waits to be resumed.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn port(&self) -> Option<u16> {
        match &self.endpoint {
            Endpoint::Tcp { port, .. } => Some(*port),
            Endpoint::Unix { .. } => None,
        }
    }

    pub fn socket(&self) -> Option<String> {
        match &self.endpoint {
            Endpoint::Tcp { .. } => None,
            Endpoint::Unix { path } => Some(path.display().to_string()),
        }
    }
}

/// The session's single connection to the proxy.
pub(crate) struct Link {
    config: Arc<RelayConfig>,
    connector: Arc<dyn Connector>,
    state: SessionState,
    transport: Option<Box<dyn Transport>>,
    /// Last sequence number issued; never reset
    sequence: u64,
    /// Bumped on every successful connect
    epoch: u64,
    endpoint: Option<Endpoint>,
    session_info: Option<String>,
    /// Set while this link's backend is suspended, with the epoch it had
    suspended: Option<(SuspendedSession, u64)>,
    pub(crate) prepared: PreparedCache,
}

impl Link {
    pub(crate) fn new(config: Arc<RelayConfig>, connector: Arc<dyn Connector>) -> Self {
        let prepared = PreparedCache::new(config.statement_cache_capacity);
        Self {
            config,
            connector,
            state: SessionState::Disconnected,
            transport: None,
            sequence: 0,
            epoch: 0,
            endpoint: None,
            session_info: None,
            suspended: None,
            prepared,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        self.state == SessionState::Ready && self.transport.is_some()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub(crate) fn session_info(&self) -> Option<&str> {
        self.session_info.as_deref()
    }

    pub(crate) fn suspended(&self) -> Option<&SuspendedSession> {
        self.suspended.as_ref().map(|(session, _)| session)
    }

    /// Make sure a ready transport exists, connecting if needed.
    ///
    /// `autocommit` is the session's current mode; a fresh backend is switched
    /// to manual commit when it is off.
    pub(crate) async fn ensure_live(&mut self, autocommit: bool) -> RelayResult<()> {
        match self.state {
            SessionState::Closed => return Err(RelayError::SessionClosed),
            SessionState::Ready if self.transport.is_some() => return Ok(()),
            _ => {}
        }

        let config = Arc::clone(&self.config);
        if config.endpoints.is_empty() {
            return Err(RelayError::config("no endpoints configured"));
        }

        if let Some((session, _)) = self.suspended.take() {
            log::info!(
                "abandoning suspended session {} at {}",
                session.token,
                session.endpoint
            );
        }
        self.state = SessionState::Connecting;
        let mut last_error = None;

        for attempt in 0..config.tries {
            if attempt > 0 && !config.retry_time.is_zero() {
                tokio::time::sleep(config.retry_time).await;
            }
            let endpoint = &config.endpoints[attempt as usize % config.endpoints.len()];

            match self.attempt(endpoint, autocommit).await {
                Ok(transport) => {
                    self.transport = Some(transport);
                    self.epoch += 1;
                    self.prepared.clear();
                    self.endpoint = Some(endpoint.clone());
                    self.state = SessionState::Ready;
                    log::info!(
                        "connected to {} (attempt {}, link epoch {})",
                        endpoint,
                        attempt + 1,
                        self.epoch
                    );
                    return Ok(());
                }
                Err(e @ RelayError::AuthFailed(_)) => {
                    log::warn!("authentication to {} rejected: {}", endpoint, e);
                    self.state = SessionState::Disconnected;
                    return Err(e);
                }
                Err(e) => {
                    log::warn!(
                        "connect attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        config.tries,
                        endpoint,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        self.state = SessionState::Disconnected;
        Err(RelayError::Connect {
            attempts: config.tries,
            source: Box::new(last_error.unwrap_or(RelayError::Closed)),
        })
    }

    async fn attempt(&mut self, endpoint: &Endpoint, autocommit: bool) -> RelayResult<Box<dyn Transport>> {
        let mut transport = self
            .connector
            .open(endpoint, self.config.connect_timeout)
            .await?;

        match self.handshake(transport.as_mut(), autocommit).await {
            Ok(()) => Ok(transport),
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self, transport: &mut dyn Transport, autocommit: bool) -> RelayResult<()> {
        let config = Arc::clone(&self.config);
        let limit = config.connect_timeout;

        let mut scram = match config.auth {
            AuthMethod::Plain => None,
            AuthMethod::ScramSha256 => Some(ScramClient::new(&config.user, &config.password)),
        };
        let auth = match &scram {
            None => AuthRequest::Plain {
                password: config.password.clone(),
            },
            Some(client) => AuthRequest::Scram {
                client_first: client.client_first(),
            },
        };

        let request = Request::Authenticate {
            user: config.user.clone(),
            client_info: config.client_info.clone(),
            auth,
        };
        let payload = self.exchange_on(transport, &request, limit).await?;

        let session_info = match (payload, scram.as_mut()) {
            (Payload::AuthOk { session_info, .. }, None) => session_info,
            (
                Payload::AuthChallenge {
                    nonce,
                    salt,
                    iterations,
                },
                Some(client),
            ) => {
                log::debug!("SCRAM challenge received ({} iterations)", iterations);
                let client_final = client.respond(&nonce, &salt, iterations)?;
                let proof = Request::AuthProof { client_final };
                match self.exchange_on(transport, &proof, limit).await? {
                    Payload::AuthOk {
                        server_signature,
                        session_info,
                    } => {
                        client.verify(&server_signature)?;
                        session_info
                    }
                    other => return Err(other.unexpected(RequestKind::AuthProof)),
                }
            }
            (other, _) => return Err(other.unexpected(RequestKind::Authenticate)),
        };
        log::debug!("authenticated as {:?}: {}", config.user, session_info);
        self.session_info = Some(session_info);

        if !autocommit {
            let request = Request::SetAutocommit { on: false };
            match self.exchange_on(transport, &request, limit).await? {
                Payload::Ack => {}
                other => return Err(other.unexpected(RequestKind::SetAutocommit)),
            }
        }
        Ok(())
    }

    /// Detach from a backend the proxy has just suspended as `token`.
    ///
    /// The transport is released without ending the session. `socket` wins
    /// over `port` when the proxy reports both.
    pub(crate) async fn detach_suspended(&mut self, token: u64, port: u16, socket: &str) -> SuspendedSession {
        let endpoint = if !socket.is_empty() {
            Endpoint::unix(socket)
        } else {
            let host = match &self.endpoint {
                Some(Endpoint::Tcp { host, .. }) => host.clone(),
                _ => "localhost".to_string(),
            };
            Endpoint::tcp(host, port)
        };
        let session = SuspendedSession::new(token, endpoint);
        self.disconnect().await;
        log::info!("session suspended as {} at {}", token, session.endpoint);
        self.suspended = Some((session.clone(), self.epoch));
        session
    }

    /// Reattach to a suspended backend.
    ///
    /// Resuming this link's own suspension keeps its epoch and prepared
    /// statements, so cursors and pending work stay valid. Any other backend
    /// counts as a new link.
    pub(crate) async fn resume(&mut self, session: &SuspendedSession, autocommit: bool) -> RelayResult<()> {
        if self.state == SessionState::Closed {
            return Err(RelayError::SessionClosed);
        }
        self.disconnect().await;

        let limit = self.config.connect_timeout;
        let mut transport = self.connector.open(&session.endpoint, limit).await?;
        let request = Request::ResumeSession {
            token: session.token,
        };
        let result = match self.exchange_on(transport.as_mut(), &request, limit).await {
            Ok(Payload::AuthOk { session_info, .. }) => Ok(session_info),
            Ok(other) => Err(other.unexpected(RequestKind::ResumeSession)),
            Err(e) => Err(e),
        };
        let session_info = match result {
            Ok(info) => info,
            Err(e) => {
                transport.close().await;
                return Err(e);
            }
        };

        let own = matches!(
            &self.suspended,
            Some((mine, epoch)) if mine.token == session.token && *epoch == self.epoch
        );
        if !own {
            self.epoch += 1;
            self.prepared.clear();
            if !autocommit {
                let request = Request::SetAutocommit { on: false };
                let replay = match self.exchange_on(transport.as_mut(), &request, limit).await {
                    Ok(Payload::Ack) => Ok(()),
                    Ok(other) => Err(other.unexpected(RequestKind::SetAutocommit)),
                    Err(e) => Err(e),
                };
                if let Err(e) = replay {
                    transport.close().await;
                    return Err(e);
                }
            }
        }

        self.suspended = None;
        self.transport = Some(transport);
        self.endpoint = Some(session.endpoint.clone());
        self.session_info = Some(session_info);
        self.state = SessionState::Ready;
        log::info!(
            "resumed session {} at {} (link epoch {})",
            session.token,
            session.endpoint,
            self.epoch
        );
        Ok(())
    }

    /// One request/response on a transport that is not yet installed.
    async fn exchange_on(
        &mut self,
        transport: &mut dyn Transport,
        request: &Request,
        limit: Duration,
    ) -> RelayResult<Payload> {
        self.sequence += 1;
        into_payload(exchange(transport, self.sequence, request, limit).await?)
    }

    /// Send `request` on the ready transport and wait for its response.
    ///
    /// Transport-class failures drop the transport before returning.
    pub(crate) async fn round_trip(&mut self, request: &Request) -> RelayResult<Payload> {
        let limit = self.config.io_timeout;
        self.round_trip_within(request, limit).await
    }

    pub(crate) async fn round_trip_within(
        &mut self,
        request: &Request,
        limit: Duration,
    ) -> RelayResult<Payload> {
        if self.state == SessionState::Closed {
            return Err(RelayError::SessionClosed);
        }
        self.sequence += 1;
        let sequence = self.sequence;

        let result = match self.transport.as_mut() {
            Some(transport) if self.state == SessionState::Ready => {
                exchange(transport.as_mut(), sequence, request, limit).await
            }
            _ => Err(RelayError::Closed),
        };

        match result {
            Ok(body) => into_payload(body),
            Err(e) => {
                if e.is_transport() {
                    log::warn!("dropping link after {:?} failed: {}", request.kind(), e);
                    self.disconnect().await;
                }
                Err(e)
            }
        }
    }

    /// Best-effort request bounded by `close_timeout`. Failures are logged.
    pub(crate) async fn notify(&mut self, request: &Request) {
        if !self.is_ready() {
            return;
        }
        let limit = self.config.close_timeout;
        match tokio::time::timeout(limit, self.round_trip_within(request, limit)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::warn!("{:?} failed: {}", request.kind(), e),
            Err(_) => {
                log::warn!("{:?} timed out after {:?}", request.kind(), limit);
                // The response may still arrive and would desynchronize the stream
                self.disconnect().await;
            }
        }
    }

    /// Drop the link after a response that does not answer `request`.
    pub(crate) async fn unexpected(&mut self, payload: Payload, request: RequestKind) -> RelayError {
        self.disconnect().await;
        payload.unexpected(request)
    }

    /// Drop the transport. The next `ensure_live` reconnects.
    pub(crate) async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        if self.state != SessionState::Closed {
            self.state = SessionState::Disconnected;
        }
    }

    /// End the session on the proxy and release the transport. Terminal.
    pub(crate) async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.notify(&Request::Close {
            target: CloseTarget::Session,
        })
        .await;
        self.disconnect().await;
        self.prepared.clear();
        self.suspended = None;
        self.state = SessionState::Closed;
        log::info!("session closed");
    }
}

/// Write one request and read its response, checking the sequence number.
async fn exchange(
    transport: &mut dyn Transport,
    sequence: u64,
    request: &Request,
    limit: Duration,
) -> RelayResult<ResponseBody> {
    let frame = request.encode(sequence)?;
    log::debug!("-> {:?} seq={} ({} bytes)", request.kind(), sequence, frame.len());
    with_timeout(limit, transport.send_frame(&frame)).await?;

    let reply = with_timeout(limit, transport.recv_frame()).await?;
    let response = Response::decode(reply)?;
    if response.sequence != sequence {
        log::warn!(
            "response sequence {} does not match request {}",
            response.sequence,
            sequence
        );
        return Err(RelayError::protocol(format!(
            "expected response to request {}, got {}",
            sequence, response.sequence
        )));
    }
    log::debug!("<- seq={}", sequence);
    Ok(response.body)
}

fn into_payload(body: ResponseBody) -> RelayResult<Payload> {
    match body {
        ResponseBody::Ok(payload) => Ok(payload),
        ResponseBody::ServerError { code, message } => Err(RelayError::Exec { code, message }),
        ResponseBody::AuthFailed { message } => Err(RelayError::AuthFailed(message)),
    }
}
