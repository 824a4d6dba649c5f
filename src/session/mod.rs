//! Per-connection protocol state machine.
//!
//! A [`Connection`] never touches a socket itself. [`Connection::step`] runs
//! the current state against the bytes already buffered in the client and
//! server [`Socket`]s and tells the driver what it is waiting for: readable
//! or writable readiness on one side, or a new backend connection. Partially
//! assembled packets and unsent bytes live in the sockets, so a step that
//! would block loses nothing and is simply re-entered later.

mod injection;
mod parse;
mod state;

pub use injection::{Injection, InjectionQueue};
pub use parse::{Classification, ClassifyContext, ParseState, QueryPhase};
pub use state::ConnectionState;

use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::health::{BackendLease, BackendRegistry};
use crate::hooks::{HookDecision, HookDispatcher, HookFactory, HookPoint, HookResult, ProxyHooks};
use crate::metrics::metrics;
use crate::protocol::{
    is_err, is_ok, markers, AuthChallenge, AuthResponse, ChangeUser, Command, DecodeError,
    ErrPacket, OkPacket, Packet, ProtocolError, ResultSet,
};
use crate::router::BackendSelector;
use crate::socket::Socket;

/// Which peer of the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn name(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Server => "server",
        }
    }
}

/// Readiness a blocked step is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read(Side),
    Write(Side),
}

/// Backend the driver should open a connection to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendTarget {
    pub index: usize,
    pub addr: SocketAddr,
}

/// Outcome of one [`Connection::step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// State changed or work was done; step again
    Advanced,
    WouldBlock(Interest),
    /// Connect to the backend, then report through
    /// [`Connection::server_connected`] or
    /// [`Connection::server_connect_failed`]
    Connect(BackendTarget),
    /// Connection is finished and cleaned up
    Done,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("all backends are down")]
    NoBackend,
    #[error("no pooled connection for this user on backend {index}")]
    PoolMiss { index: usize },
    #[error("unknown backend {0}")]
    UnknownBackend(usize),
    #[error("no backend connection")]
    NoServer,
    #[error("unexpected auth result {0:#04x}")]
    UnexpectedAuthResult(u8),
}

impl From<DecodeError> for SessionError {
    fn from(e: DecodeError) -> Self {
        SessionError::Protocol(ProtocolError::Decode(e))
    }
}

impl SessionError {
    /// Metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Protocol(ProtocolError::Decode(_)) => "decode",
            SessionError::Protocol(ProtocolError::Sequence { .. }) => "sequence",
            SessionError::Protocol(_) => "protocol",
            SessionError::Io(_) => "io",
            SessionError::NoBackend => "no_backend",
            SessionError::PoolMiss { .. } => "pool_miss",
            SessionError::UnknownBackend(_) => "unknown_backend",
            SessionError::NoServer => "no_server",
            SessionError::UnexpectedAuthResult(_) => "auth",
        }
    }
}

/// Everything connections share
pub struct ProxyContext {
    pub registry: Arc<BackendRegistry>,
    pub selector: Arc<dyn BackendSelector>,
    pub settings: ProxyConfig,
    pub hooks: Arc<dyn HookFactory>,
}

pub struct Connection {
    id: u32,
    state: ConnectionState,
    client: Socket,
    server: Option<Socket>,
    backend: Option<BackendLease>,
    /// Backend the driver is currently connecting to
    connecting: Option<BackendTarget>,
    connect_attempts: usize,
    ctx: Arc<ProxyContext>,
    hooks: HookDispatcher,
    parse: ParseState,
    injections: InjectionQueue,
    /// Injection whose response is being read
    current: Option<Injection>,
    /// The handshake came from a pooled, already authenticated socket
    pooled_handshake: bool,
    /// The auth result is the answer to our COM_CHANGE_USER
    auth_via_change_user: bool,
    result_finished: bool,
    /// First two bytes of the last payload queued to the client
    last_reply: [u8; 2],
    client_closed: bool,
    cleaned_up: bool,
}

impl Connection {
    pub fn new(id: u32, client: Socket, ctx: Arc<ProxyContext>) -> Self {
        let hooks = HookDispatcher::new(ctx.hooks.create());
        Self {
            id,
            state: ConnectionState::Init,
            client,
            server: None,
            backend: None,
            connecting: None,
            connect_attempts: 0,
            ctx,
            hooks,
            parse: ParseState::Idle,
            injections: InjectionQueue::default(),
            current: None,
            pooled_handshake: false,
            auth_via_change_user: false,
            result_finished: false,
            last_reply: [0; 2],
            client_closed: false,
            cleaned_up: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client(&self) -> &Socket {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut Socket {
        &mut self.client
    }

    pub fn server(&self) -> Option<&Socket> {
        self.server.as_ref()
    }

    pub fn server_mut(&mut self) -> Option<&mut Socket> {
        self.server.as_mut()
    }

    /// Index of the backend this connection is assigned to
    pub fn backend_index(&self) -> Option<usize> {
        self.backend.as_ref().map(BackendLease::index)
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.ctx.registry
    }

    pub fn settings(&self) -> ProxyConfig {
        self.ctx.settings
    }

    pub fn parse_state(&self) -> &ParseState {
        &self.parse
    }

    pub fn injections(&self) -> &InjectionQueue {
        &self.injections
    }

    pub fn injections_mut(&mut self) -> &mut InjectionQueue {
        &mut self.injections
    }

    // ------------------------------------------------------------------
    // Hook side channel
    // ------------------------------------------------------------------

    pub fn send_ok(&mut self, ok: OkPacket) {
        self.queue_to_client(ok.encode());
    }

    pub fn send_error(&mut self, err: ErrPacket) {
        self.queue_to_client(err.encode());
    }

    pub fn send_result_set(&mut self, result: &ResultSet) {
        for payload in result.encode() {
            self.queue_to_client(payload);
        }
    }

    /// Queue an arbitrary payload, numbered like any other client packet
    pub fn send_raw(&mut self, payload: Bytes) {
        self.queue_to_client(payload);
    }

    /// Queue a command payload (command byte included) for the backend
    pub fn inject(&mut self, id: u32, query: impl Into<Bytes>, resultset_is_needed: bool) {
        self.injections
            .push_back(Injection::new(id, query.into(), resultset_is_needed));
    }

    /// Queue a `COM_QUERY` for the backend
    pub fn inject_query(&mut self, id: u32, sql: &str, resultset_is_needed: bool) {
        let mut payload = BytesMut::with_capacity(1 + sql.len());
        payload.put_u8(Command::Query as u8);
        payload.put_slice(sql.as_bytes());
        self.inject(id, payload.freeze(), resultset_is_needed);
    }

    /// Move this connection to a pooled socket of another backend.
    ///
    /// Only a socket logged in with the client's own username and default
    /// schema is taken; the previous server socket goes back to its pool.
    pub fn swap_backend(&mut self, index: usize) -> Result<(), SessionError> {
        if self.backend_index() == Some(index) {
            return Ok(());
        }

        let backend = Arc::clone(
            self.ctx
                .registry
                .get(index)
                .ok_or(SessionError::UnknownBackend(index))?,
        );
        let socket = backend
            .pool
            .checkout(&self.client.identity.username, &self.client.identity.default_db)
            .ok_or(SessionError::PoolMiss { index })?;
        let lease = self
            .ctx
            .registry
            .lease(index)
            .ok_or(SessionError::UnknownBackend(index))?;

        let previous = self.backend_index();
        self.release_server();
        self.server = Some(socket);
        self.backend = Some(lease);

        info!(
            conn_id = self.id,
            from = ?previous,
            to = index,
            backend = %backend.addr,
            "Switched backend"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Driver interface
    // ------------------------------------------------------------------

    /// Run the current state once
    pub fn step(&mut self) -> Step {
        match self.try_step() {
            Ok(step) => step,
            Err(e) => {
                self.fail(e);
                Step::Advanced
            }
        }
    }

    /// The backend connection requested by [`Step::Connect`] is open
    pub fn server_connected(&mut self, socket: Socket) {
        let Some(target) = self.connecting.take() else {
            warn!(conn_id = self.id, "Unexpected backend connection, dropping it");
            return;
        };
        self.backend = self.ctx.registry.lease(target.index);
        self.server = Some(socket);
        debug!(conn_id = self.id, backend = %target.addr, "Connected to backend");
        self.set_state(ConnectionState::ReadHandshake);
    }

    /// The backend connection requested by [`Step::Connect`] failed.
    ///
    /// The backend is marked DOWN and the next step picks another one.
    pub fn server_connect_failed(&mut self, now: Instant, error: &io::Error) {
        let Some(target) = self.connecting.take() else {
            return;
        };
        warn!(conn_id = self.id, backend = %target.addr, error = %error, "Backend connect failed");
        if let Some(backend) = self.ctx.registry.get(target.index) {
            metrics().record_connect_failure(backend.addr.name());
        }
        self.ctx.registry.mark_down(target.index, now);
    }

    /// A zero-length read: the peer closed its side
    pub fn peer_closed(&mut self, side: Side) {
        self.injections.clear();
        self.current = None;

        match side {
            Side::Client => {
                debug!(conn_id = self.id, state = %self.state, "Client closed connection");
                self.client_closed = true;
                self.client.discard_buffers();
                if self.state.is_terminal() {
                    self.force_error();
                } else {
                    self.set_state(ConnectionState::CloseClient);
                }
            }
            Side::Server => {
                warn!(conn_id = self.id, state = %self.state, "Backend closed connection");
                self.server = None;
                self.force_error();
            }
        }
    }

    /// A read or write failed
    pub fn io_failed(&mut self, side: Side, error: &io::Error) {
        warn!(conn_id = self.id, side = side.name(), state = %self.state, error = %error, "I/O error");
        metrics().record_protocol_error("io");
        self.injections.clear();
        self.current = None;

        match side {
            Side::Client => {
                self.client_closed = true;
                self.client.discard_buffers();
            }
            Side::Server => self.server = None,
        }
        self.force_error();
    }

    // ------------------------------------------------------------------
    // States
    // ------------------------------------------------------------------

    fn try_step(&mut self) -> Result<Step, SessionError> {
        match self.state {
            ConnectionState::Init => {
                let decision = self.call_hook(HookPoint::Init, |h, c| h.init(c));
                if is_refusal(decision) {
                    return Ok(self.refuse(HookPoint::Init));
                }
                self.set_state(ConnectionState::ConnectServer);
                Ok(Step::Advanced)
            }
            ConnectionState::ConnectServer => self.connect_server(),
            ConnectionState::ReadHandshake => self.read_handshake(),
            ConnectionState::SendHandshake => {
                self.after_flush(Side::Client, HookPoint::SendHandshake, ConnectionState::ReadAuth)
            }
            ConnectionState::ReadAuth => self.read_auth(),
            ConnectionState::SendAuth => {
                self.after_flush(Side::Server, HookPoint::SendAuth, ConnectionState::ReadAuthResult)
            }
            ConnectionState::ReadAuthResult => self.read_auth_result(),
            ConnectionState::SendAuthResult => self.send_auth_result(),
            ConnectionState::ReadAuthOldPassword => self.read_auth_old_password(),
            ConnectionState::SendAuthOldPassword => {
                if let Some(step) = self.pending_write(Side::Server) {
                    return Ok(step);
                }
                self.set_state(ConnectionState::ReadAuthResult);
                Ok(Step::Advanced)
            }
            ConnectionState::ReadQuery => self.read_query(),
            ConnectionState::SendQuery => self.send_query(),
            ConnectionState::ReadQueryResult => self.read_query_result(),
            ConnectionState::SendQueryResult => self.send_query_result(),
            ConnectionState::CloseClient => {
                if let Some(step) = self.pending_write(Side::Client) {
                    return Ok(step);
                }
                self.cleanup();
                Ok(Step::Done)
            }
            ConnectionState::SendError => {
                if let Some(step) = self.pending_write(Side::Client) {
                    return Ok(step);
                }
                self.set_state(ConnectionState::Error);
                Ok(Step::Advanced)
            }
            ConnectionState::Error => {
                self.cleanup();
                Ok(Step::Done)
            }
        }
    }

    fn connect_server(&mut self) -> Result<Step, SessionError> {
        if let Some(target) = self.connecting {
            return Ok(Step::Connect(target));
        }

        match self.call_hook(HookPoint::ConnectServer, |h, c| h.connect_server(c)) {
            HookDecision::SendResult => {
                // the hook answers the client itself, no backend involved
                self.set_state(ConnectionState::SendHandshake);
                return Ok(Step::Advanced);
            }
            d if is_refusal(d) => return Ok(self.refuse(HookPoint::ConnectServer)),
            _ => {}
        }

        let now = Instant::now();
        let registry = Arc::clone(&self.ctx.registry);
        registry.wake_down_backends(now);

        let picked = if self.connect_attempts > registry.len() {
            None
        } else {
            self.ctx.selector.pick(registry.backends())
        };
        let Some(index) = picked else {
            warn!(conn_id = self.id, attempts = self.connect_attempts, "All backends are down");
            metrics().record_protocol_error(SessionError::NoBackend.kind());
            self.send_error(ErrPacket::proxy("(proxy) all backends are down"));
            self.set_state(ConnectionState::SendError);
            return Ok(Step::Advanced);
        };
        let backend = Arc::clone(registry.get(index).ok_or(SessionError::UnknownBackend(index))?);

        if backend.pool.can_serve() {
            if let Some(socket) = backend.pool.checkout_any() {
                if let Some(mut challenge) = socket.challenge.clone() {
                    debug!(
                        conn_id = self.id,
                        backend = %backend.addr,
                        thread_id = socket.identity.thread_id,
                        "Serving handshake from pooled connection"
                    );
                    self.backend = registry.lease(index);
                    self.server = Some(socket);
                    self.pooled_handshake = true;

                    challenge.clear_unsupported();
                    self.client.reset_packet_id();
                    self.client.queue_payload(challenge.encode());
                    self.client.challenge = Some(challenge);

                    self.set_state(ConnectionState::SendHandshake);
                    return Ok(Step::Advanced);
                }
            }
        }

        self.connect_attempts += 1;
        let target = BackendTarget {
            index,
            addr: backend.addr.socket_addr(),
        };
        self.connecting = Some(target);
        Ok(Step::Connect(target))
    }

    fn read_handshake(&mut self) -> Result<Step, SessionError> {
        let Some(packet) = self.server_socket()?.next_packet()? else {
            return Ok(Step::WouldBlock(Interest::Read(Side::Server)));
        };

        if is_err(&packet.payload) {
            // e.g. "host is blocked"; the client gets the server's own words
            let err = ErrPacket::decode(&packet.payload)?;
            warn!(conn_id = self.id, code = err.error_code, message = %err.message, "Backend refused connection");
            self.queue_to_client(packet.payload);
            self.set_state(ConnectionState::SendError);
            return Ok(Step::Advanced);
        }

        let challenge = AuthChallenge::decode(&packet.payload)?;
        {
            let server = self.server_socket()?;
            server.identity.thread_id = challenge.thread_id;
            server.identity.server_version = challenge.server_version;
            server.challenge = Some(challenge.clone());
        }
        if let Some(index) = self.backend_index() {
            self.ctx.registry.mark_up(index, Instant::now());
        }
        debug!(
            conn_id = self.id,
            server_version = %challenge.server_version_str,
            thread_id = challenge.thread_id,
            "Received handshake"
        );

        match self.call_hook(HookPoint::ReadHandshake, |h, c| h.read_handshake(c)) {
            HookDecision::SendResult => {}
            d if is_refusal(d) => return Ok(self.refuse(HookPoint::ReadHandshake)),
            _ => {
                let mut challenge = challenge;
                challenge.clear_unsupported();
                self.client.reset_packet_id();
                self.client.queue_payload(challenge.encode());
                self.client.challenge = Some(challenge);
            }
        }
        self.set_state(ConnectionState::SendHandshake);
        Ok(Step::Advanced)
    }

    fn read_auth(&mut self) -> Result<Step, SessionError> {
        let Some(packet) = self.client.next_packet()? else {
            return Ok(Step::WouldBlock(Interest::Read(Side::Client)));
        };

        let auth = AuthResponse::decode(&packet.payload)?;
        self.client.identity.username = auth.username.clone();
        self.client.identity.default_db = auth.default_db().to_string();
        self.client.identity.scrambled_password = auth.auth_data.clone();
        debug!(conn_id = self.id, user = %auth.username, db = %auth.default_db(), "Received auth");
        self.client.response = Some(auth);

        match self.call_hook(HookPoint::ReadAuth, |h, c| h.read_auth(c)) {
            HookDecision::SendResult => {
                self.set_state(ConnectionState::SendAuthResult);
                return Ok(Step::Advanced);
            }
            d if is_refusal(d) => return Ok(self.refuse(HookPoint::ReadAuth)),
            _ => {}
        }

        if self.pooled_handshake {
            return self.authenticate_pooled();
        }

        self.server_socket()?.queue_packet(packet);
        self.set_state(ConnectionState::SendAuth);
        Ok(Step::Advanced)
    }

    /// Log the client in on a socket taken from the pool
    fn authenticate_pooled(&mut self) -> Result<Step, SessionError> {
        let Some(auth) = self.client.response.clone() else {
            return Err(ProtocolError::Unsupported("auth without response").into());
        };

        if self.ctx.settings.pool_change_user {
            let payload = ChangeUser::from_auth(&auth).encode();
            self.parse = ParseState::for_command(&payload);
            self.auth_via_change_user = true;

            let server = self.server_socket()?;
            server.reset_packet_id();
            server.queue_payload(payload);
            self.set_state(ConnectionState::SendAuth);
            return Ok(Step::Advanced);
        }

        let matches = self.server.as_ref().is_some_and(|server| {
            server.identity.username == self.client.identity.username
                && server.identity.default_db == self.client.identity.default_db
                && server.identity.scrambled_password == self.client.identity.scrambled_password
        });

        if matches {
            self.client.is_authed = true;
            self.send_ok(OkPacket::default());
            self.set_state(ConnectionState::SendAuthResult);
        } else {
            debug!(conn_id = self.id, user = %auth.username, "Pooled credentials differ, rejecting login");
            self.release_server();
            self.send_error(ErrPacket::new(1045, "28000", "(proxy-pool) login failed"));
            self.set_state(ConnectionState::SendError);
        }
        Ok(Step::Advanced)
    }

    fn read_auth_result(&mut self) -> Result<Step, SessionError> {
        let Some(packet) = self.server_socket()?.next_packet()? else {
            return Ok(Step::WouldBlock(Interest::Read(Side::Server)));
        };

        let mut forward = true;
        if self.auth_via_change_user {
            let ctx = self.classify_context();
            let verdict = self.parse.classify(&packet.payload, &ctx)?;
            forward = verdict.forward;
            if !verdict.finished {
                // first half of a duplicated ERR; the copy is still coming
                self.queue_to_client(packet.payload);
                return Ok(Step::Advanced);
            }
        }

        match self.call_hook(HookPoint::ReadAuthResult, |h, c| h.read_auth_result(c, &packet)) {
            HookDecision::SendResult => {}
            d if is_refusal(d) => return Ok(self.refuse(HookPoint::ReadAuthResult)),
            _ if forward => self.queue_to_client(packet.payload.clone()),
            _ => {}
        }

        if is_ok(&packet.payload) {
            let identity = self.client.identity.clone();
            let server = self.server_socket()?;
            server.is_authed = true;
            server.identity.username = identity.username;
            server.identity.default_db = identity.default_db;
            server.identity.scrambled_password = identity.scrambled_password;
            self.client.is_authed = true;
            if self.auth_via_change_user {
                self.auth_via_change_user = false;
                self.parse = ParseState::Idle;
            }
            info!(conn_id = self.id, user = %self.client.identity.username, backend = ?self.backend_index(), "Client authenticated");
        } else if is_err(&packet.payload) {
            self.server_socket()?.is_authed = false;
            if self.auth_via_change_user {
                self.auth_via_change_user = false;
                self.parse = ParseState::Idle;
            }
        }

        self.set_state(ConnectionState::SendAuthResult);
        Ok(Step::Advanced)
    }

    fn send_auth_result(&mut self) -> Result<Step, SessionError> {
        if let Some(step) = self.pending_write(Side::Client) {
            return Ok(step);
        }
        let decision = self.call_hook(HookPoint::SendAuthResult, |h, c| h.send_auth_result(c));
        if is_refusal(decision) {
            return Ok(self.refuse(HookPoint::SendAuthResult));
        }

        let next = match self.last_reply {
            [markers::OK, _] => {
                self.parse = ParseState::Idle;
                ConnectionState::ReadQuery
            }
            [markers::ERR, _] => ConnectionState::Error,
            [markers::EOF, _] => ConnectionState::ReadAuthOldPassword,
            // caching_sha2 fast path: an OK follows without client input
            [markers::AUTH_MORE_DATA, markers::FAST_AUTH_OK] => ConnectionState::ReadAuthResult,
            [markers::AUTH_MORE_DATA, _] => ConnectionState::ReadAuthOldPassword,
            [other, _] => return Err(SessionError::UnexpectedAuthResult(other)),
        };
        self.set_state(next);
        Ok(Step::Advanced)
    }

    fn read_auth_old_password(&mut self) -> Result<Step, SessionError> {
        let Some(packet) = self.client.next_packet()? else {
            return Ok(Step::WouldBlock(Interest::Read(Side::Client)));
        };
        self.server_socket()?.queue_packet(packet);
        self.set_state(ConnectionState::SendAuthOldPassword);
        Ok(Step::Advanced)
    }

    fn read_query(&mut self) -> Result<Step, SessionError> {
        let Some(packet) = self.client.next_packet()? else {
            return Ok(Step::WouldBlock(Interest::Read(Side::Client)));
        };

        if self.parse.is_load_data() {
            let last = packet.payload.is_empty();
            self.server_socket()?.queue_packet(packet);
            if last {
                self.parse.load_data_finished();
            }
            self.set_state(ConnectionState::SendQuery);
            return Ok(Step::Advanced);
        }

        let Some(&first) = packet.payload.first() else {
            return Err(DecodeError::TruncatedPacket {
                needed: 1,
                available: 0,
            }
            .into());
        };
        let command = Command::from(first);
        metrics().record_command(command.name());
        debug!(conn_id = self.id, command = command.name(), len = packet.payload.len(), "Received command");

        if command == Command::Quit {
            debug!(conn_id = self.id, "Client sent QUIT");
            self.set_state(ConnectionState::CloseClient);
            return Ok(Step::Advanced);
        }

        self.result_finished = false;
        match self.call_hook(HookPoint::ReadQuery, |h, c| h.read_query(c, &packet)) {
            HookDecision::SendResult => {
                self.result_finished = true;
                self.set_state(ConnectionState::SendQueryResult);
            }
            HookDecision::SendQuery | HookDecision::SendInjection => {
                if !self.dispatch_next_injection()? {
                    warn!(conn_id = self.id, "Hook asked to inject but queued nothing, forwarding");
                    self.forward_command(packet)?;
                }
            }
            d if is_refusal(d) => return Ok(self.refuse(HookPoint::ReadQuery)),
            _ => self.forward_command(packet)?,
        }
        Ok(Step::Advanced)
    }

    fn send_query(&mut self) -> Result<Step, SessionError> {
        if let Some(step) = self.pending_write(Side::Server) {
            return Ok(step);
        }

        if self.parse.is_load_data() {
            self.set_state(ConnectionState::ReadQuery);
            return Ok(Step::Advanced);
        }

        if !self.parse.expects_response() {
            // COM_STMT_CLOSE and friends
            self.current = None;
            self.parse = ParseState::Idle;
            if !self.dispatch_next_injection()? {
                self.set_state(ConnectionState::ReadQuery);
            }
            return Ok(Step::Advanced);
        }

        self.result_finished = false;
        self.set_state(ConnectionState::ReadQueryResult);
        Ok(Step::Advanced)
    }

    fn read_query_result(&mut self) -> Result<Step, SessionError> {
        let mut progressed = false;
        while let Some(packet) = self.server_socket()?.next_packet()? {
            progressed = true;
            if self.handle_result_packet(packet)? {
                self.result_finished = true;
                break;
            }
        }

        if !progressed {
            return Ok(Step::WouldBlock(Interest::Read(Side::Server)));
        }
        self.set_state(ConnectionState::SendQueryResult);
        Ok(Step::Advanced)
    }

    /// Route one response packet; returns whether the response is complete
    fn handle_result_packet(&mut self, packet: Packet) -> Result<bool, SessionError> {
        let ctx = self.classify_context();
        let verdict = self.parse.classify(&packet.payload, &ctx)?;
        if verdict.finished {
            self.track_session_change(&packet.payload);
        }

        let needs_result = match self.current.as_mut() {
            Some(injection) => {
                injection.record(&packet, Instant::now());
                injection.resultset_is_needed
            }
            None => false,
        };

        if !needs_result && verdict.forward {
            self.queue_to_client(packet.payload);
        }

        if verdict.finished {
            if let Some(injection) = self.current.take() {
                debug!(
                    conn_id = self.id,
                    injection_id = injection.id,
                    query_time_us = ?injection.query_time_us(),
                    response_time_us = ?injection.response_time_us(),
                    "Injected query finished"
                );
                if needs_result {
                    self.deliver_injection_result(injection);
                } else {
                    self.call_hook(HookPoint::ReadQueryResult, |h, c| {
                        h.read_query_result(c, &injection)
                    });
                }
            }
        }
        Ok(verdict.finished)
    }

    fn deliver_injection_result(&mut self, injection: Injection) {
        let decision = self.call_hook(HookPoint::ReadQueryResult, |h, c| {
            h.read_query_result(c, &injection)
        });
        match decision {
            HookDecision::IgnoreResult => {
                debug!(conn_id = self.id, injection_id = injection.id, "Dropped injected result");
            }
            HookDecision::SendResult => {}
            d if is_refusal(d) => {
                self.send_error(ErrPacket::proxy("(proxy) query result rejected"));
            }
            _ => {
                for packet in injection.result {
                    self.queue_to_client(packet.payload);
                }
            }
        }
    }

    fn send_query_result(&mut self) -> Result<Step, SessionError> {
        if let Some(step) = self.pending_write(Side::Client) {
            return Ok(step);
        }

        if !self.result_finished {
            self.set_state(ConnectionState::ReadQueryResult);
            return Ok(Step::Advanced);
        }

        let decision = self.call_hook(HookPoint::SendQueryResult, |h, c| h.send_query_result(c));
        if is_refusal(decision) {
            return Ok(self.refuse(HookPoint::SendQueryResult));
        }

        if self.parse.is_load_data() {
            self.set_state(ConnectionState::ReadQuery);
            return Ok(Step::Advanced);
        }

        self.parse = ParseState::Idle;
        if !self.dispatch_next_injection()? {
            self.set_state(ConnectionState::ReadQuery);
        }
        Ok(Step::Advanced)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn forward_command(&mut self, packet: Packet) -> Result<(), SessionError> {
        self.parse = ParseState::for_command(&packet.payload);
        let server = self.server_socket()?;
        server.reset_packet_id();
        server.queue_packet(packet);
        self.set_state(ConnectionState::SendQuery);
        Ok(())
    }

    /// Send the next queued injection; `false` when the queue is empty
    fn dispatch_next_injection(&mut self) -> Result<bool, SessionError> {
        let Some(injection) = self.injections.pop_front() else {
            return Ok(false);
        };

        let server = self.server_socket()?;
        server.reset_packet_id();
        server.queue_payload(injection.query.clone());

        self.parse = ParseState::for_command(&injection.query);
        metrics().injected_queries.inc();
        debug!(
            conn_id = self.id,
            injection_id = injection.id,
            needs_result = injection.resultset_is_needed,
            "Sending injected query"
        );
        self.current = Some(injection);
        self.set_state(ConnectionState::SendQuery);
        Ok(true)
    }

    /// Keep pool keys in line with what the session switched to
    fn track_session_change(&mut self, payload: &[u8]) {
        if !is_ok(payload) {
            return;
        }
        let (username, default_db) = match &self.parse {
            ParseState::InitDb { db } => (None, db.clone()),
            ParseState::ChangeUser {
                username,
                default_db,
                ..
            } => (Some(username.clone()), default_db.clone()),
            _ => return,
        };

        let sockets = std::iter::once(&mut self.client).chain(self.server.as_mut());
        for socket in sockets {
            if let Some(username) = &username {
                socket.identity.username = username.clone();
            }
            socket.identity.default_db = default_db.clone();
        }
    }

    fn classify_context(&self) -> ClassifyContext {
        ClassifyContext {
            server_version: self
                .server
                .as_ref()
                .map_or(0, |s| s.identity.server_version),
            fix_bug_25371: self.ctx.settings.fix_bug_25371,
        }
    }

    fn queue_to_client(&mut self, payload: Bytes) {
        self.last_reply = [
            payload.first().copied().unwrap_or(markers::OK),
            payload.get(1).copied().unwrap_or(0),
        ];
        self.client.queue_payload(payload);
    }

    fn server_socket(&mut self) -> Result<&mut Socket, SessionError> {
        self.server.as_mut().ok_or(SessionError::NoServer)
    }

    fn pending_write(&self, side: Side) -> Option<Step> {
        let pending = match side {
            Side::Client => self.client.has_pending_send(),
            Side::Server => self
                .server
                .as_ref()
                .is_some_and(Socket::has_pending_send),
        };
        pending.then_some(Step::WouldBlock(Interest::Write(side)))
    }

    /// Flush one side, run a send hook, then move on
    fn after_flush(
        &mut self,
        side: Side,
        point: HookPoint,
        next: ConnectionState,
    ) -> Result<Step, SessionError> {
        if let Some(step) = self.pending_write(side) {
            return Ok(step);
        }
        let decision = match point {
            HookPoint::SendHandshake => self.call_hook(point, |h, c| h.send_handshake(c)),
            HookPoint::SendAuth => self.call_hook(point, |h, c| h.send_auth(c)),
            _ => HookDecision::NoDecision,
        };
        if is_refusal(decision) {
            return Ok(self.refuse(point));
        }
        self.set_state(next);
        Ok(Step::Advanced)
    }

    /// Return the server socket to its pool if it can be reused, and drop
    /// the backend lease
    fn release_server(&mut self) {
        let reusable = self.current.is_none()
            && self.parse == ParseState::Idle
            && self.server.as_ref().is_some_and(Socket::is_idle_clean);

        if let (Some(server), Some(lease)) = (self.server.take(), self.backend.take()) {
            if reusable && lease.backend().pool.checkin(server) {
                debug!(conn_id = self.id, backend = %lease.backend().addr, "Returned backend connection to pool");
            }
        }
    }

    fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        self.call_hook(HookPoint::Cleanup, |h, c| h.cleanup(c));
        self.injections.clear();
        self.release_server();
        debug!(conn_id = self.id, state = %self.state, "Connection cleaned up");
    }

    fn call_hook<F>(&mut self, point: HookPoint, f: F) -> HookDecision
    where
        F: FnOnce(&mut dyn ProxyHooks, &mut Connection) -> HookResult,
    {
        let Some(mut hooks) = self.hooks.take() else {
            return HookDecision::NoDecision;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| f(hooks.as_mut(), &mut *self)));
        self.hooks.restore(hooks);

        let decision = HookDispatcher::resolve(point, self.id, outcome);
        if decision != HookDecision::NoDecision {
            debug!(conn_id = self.id, hook = point.name(), decision = ?decision, "Hook decision");
        }
        decision
    }

    /// A hook returned `Error`/`ErrorRetry`
    fn refuse(&mut self, point: HookPoint) -> Step {
        warn!(conn_id = self.id, hook = point.name(), "Hook rejected the connection");
        self.injections.clear();
        self.send_error(ErrPacket::proxy(format!("(proxy) rejected in {}", point.name())));
        self.set_state(ConnectionState::SendError);
        Step::Advanced
    }

    fn fail(&mut self, error: SessionError) {
        warn!(conn_id = self.id, state = %self.state, error = %error, "Connection failed");
        metrics().record_protocol_error(error.kind());
        self.injections.clear();
        self.current = None;

        if self.state.is_terminal() || self.client_closed {
            self.force_error();
            return;
        }
        self.send_error(ErrPacket::proxy(format!("(proxy) {}", error)));
        self.set_state(ConnectionState::SendError);
    }

    fn force_error(&mut self) {
        if self.state != ConnectionState::Error {
            debug!(conn_id = self.id, from = %self.state, "Aborting connection");
            self.state = ConnectionState::Error;
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        debug!(conn_id = self.id, from = %self.state, to = %next, "State transition");
        self.state = next;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn is_refusal(decision: HookDecision) -> bool {
    matches!(decision, HookDecision::Error | HookDecision::ErrorRetry)
}
