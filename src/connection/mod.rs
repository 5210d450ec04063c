//! Server-side connections.
//!
//! A [`Connection`] is shared between its shard's slot table, the worker
//! running its queued handler, and any [`ConnectionHandle`] given out to
//! application code. Closing marks it destroyed and releases the socket at
//! once; the memory goes away when the last of those references drops.
//!
//! ```text
//!   Reading ──request──▶ Handling ──reply──▶ Writing
//!      ▲     (queued)                           │ flushed
//!      │                                        ├─ keep-alive: reset, apply switch
//!      └────────────────────────────────────────┘
//!   inline replies (errors, redirects, 101) go straight to Writing
//! ```

pub mod queue;

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::broadcast::Subscriber;
use crate::domain::HostTable;
use crate::http::connection::Http1Session;
use crate::http::parser::ParseLimits;
use crate::http::writer::{ResponseWriter, WriteStatus};
use crate::mux::{Interest, Multiplexer, Notify, Token};
use crate::protocol::{Outcome, Protocol, ProtocolKind, Reply, SessionContext};
use crate::tls::{HandshakeStatus, TlsSession};
use crate::websocket::frame::{Opcode, encode_frame};
use queue::WorkQueue;

/// Shared, read-only state every connection of a server needs.
pub struct Environment {
    pub hosts: Arc<HostTable>,
    pub limits: ParseLimits,
    /// Worker pool for queued handlers.
    pub runtime: tokio::runtime::Handle,
}

/// Socket below the protocol roles.
pub enum Transport {
    Plain(TcpStream),
    Tls {
        stream: TcpStream,
        session: Box<dyn TlsSession>,
    },
}

impl Transport {
    pub fn stream(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls { stream, .. } => stream,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls { .. })
    }

    fn shutdown(mut self) {
        if let Transport::Tls { stream, session } = &mut self {
            session.close(stream);
        }
        let _ = self.stream().shutdown(Shutdown::Both);
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Tls { stream, session } => session.read(stream, buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Tls { stream, session } => session.write(stream, buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush(),
            Transport::Tls { stream, .. } => stream.flush(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Reading,
    /// A queued handler owns the next reply.
    Handling,
    Writing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Close,
}

struct ConnectionState {
    transport: Option<Transport>,
    protocol: Protocol,
    phase: Phase,
    keep_alive: bool,
    /// Role to enter once the reply being written is flushed.
    pending_switch: Option<Protocol>,
    /// Bytes read but not yet consumed, e.g. a pipelined request.
    leftover: BytesMut,
    out: ResponseWriter,
    interest: Interest,
}

/// Hand-off point between worker threads and the shard owning a connection.
pub struct ShardSignal {
    notifier: Arc<dyn Notify>,
    ready: Mutex<Vec<Weak<Connection>>>,
}

impl ShardSignal {
    pub fn new(notifier: Arc<dyn Notify>) -> Self {
        Self {
            notifier,
            ready: Mutex::new(Vec::new()),
        }
    }

    /// Asks the shard to flush `conn` on its next wakeup.
    pub fn schedule(&self, conn: &Arc<Connection>) {
        self.ready.lock().push(Arc::downgrade(conn));
        if let Err(e) = self.notifier.notify() {
            warn!(error = %e, "failed to wake shard");
        }
    }

    pub fn wake(&self) {
        if let Err(e) = self.notifier.notify() {
            warn!(error = %e, "failed to wake shard");
        }
    }

    pub fn drain(&self) -> Vec<Weak<Connection>> {
        std::mem::take(&mut *self.ready.lock())
    }
}

pub struct Connection {
    token: Token,
    fd: RawFd,
    peer: SocketAddr,
    destroyed: AtomicBool,
    state: Mutex<ConnectionState>,
    queue: WorkQueue,
    signal: Arc<ShardSignal>,
}

impl Connection {
    pub fn new(
        token: Token,
        transport: Transport,
        peer: SocketAddr,
        protocol: Protocol,
        signal: Arc<ShardSignal>,
    ) -> Arc<Self> {
        let fd = transport.stream().as_raw_fd();

        Arc::new(Self {
            token,
            fd,
            peer,
            destroyed: AtomicBool::new(false),
            state: Mutex::new(ConnectionState {
                transport: Some(transport),
                protocol,
                phase: Phase::Reading,
                keep_alive: true,
                pending_switch: None,
                leftover: BytesMut::new(),
                out: ResponseWriter::new(),
                interest: Interest::READ,
            }),
            queue: WorkQueue::new(),
            signal,
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.state.lock().protocol.kind()
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn handle(self: &Arc<Self>) -> ConnectionHandle {
        ConnectionHandle {
            conn: Arc::downgrade(self),
        }
    }

    /// Handles one readiness event from the multiplexer.
    pub fn on_event(
        self: &Arc<Self>,
        readable: bool,
        writable: bool,
        mux: &dyn Multiplexer,
        env: &Environment,
        scratch: &mut [u8],
    ) {
        if self.is_destroyed() {
            return;
        }

        let step = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let mut step = Step::Continue;
            if state.protocol.kind() == ProtocolKind::Tls {
                step = self.read_ready(state, mux, env, scratch);
            } else {
                if writable {
                    step = self.flush(state, mux);
                }
                if step == Step::Continue && (readable || state.phase == Phase::Reading) {
                    step = self.read_ready(state, mux, env, scratch);
                }
            }
            step
        };

        if step == Step::Close {
            self.close(mux);
        }
    }

    /// Called on the shard after a worker or a broadcast queued output.
    pub fn on_ready(self: &Arc<Self>, mux: &dyn Multiplexer, env: &Environment, scratch: &mut [u8]) {
        if self.is_destroyed() {
            return;
        }

        let step = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let mut step = self.flush(state, mux);
            if step == Step::Continue && state.phase == Phase::Reading {
                step = self.read_ready(state, mux, env, scratch);
            }
            step
        };

        if step == Step::Close {
            self.close(mux);
        }
    }

    /// Marks the connection destroyed, unregisters and shuts the socket.
    /// Safe to call more than once.
    pub fn close(&self, mux: &dyn Multiplexer) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.state.lock();
        if let Some(transport) = state.transport.take() {
            if let Err(e) = mux.remove(self.fd) {
                debug!(token = self.token, error = %e, "failed to unregister connection");
            }
            transport.shutdown();
        }
        state.out.clear();
        state.leftover.clear();
        state.pending_switch = None;

        debug!(
            token = self.token,
            peer = %self.peer,
            queued = self.queue.len(),
            "connection closed"
        );
    }

    fn read_ready(
        self: &Arc<Self>,
        state: &mut ConnectionState,
        mux: &dyn Multiplexer,
        env: &Environment,
        scratch: &mut [u8],
    ) -> Step {
        if state.protocol.kind() == ProtocolKind::Tls {
            if self.handshake(state, mux, env) == Step::Close {
                return Step::Close;
            }
            if state.protocol.kind() == ProtocolKind::Tls {
                return Step::Continue;
            }
        }

        if self.drive(state, mux, env) == Step::Close {
            return Step::Close;
        }

        while state.phase == Phase::Reading {
            let Some(transport) = state.transport.as_mut() else {
                return Step::Close;
            };

            match transport.read(scratch) {
                Ok(0) => {
                    debug!(token = self.token, peer = %self.peer, "peer closed connection");
                    return Step::Close;
                }
                Ok(n) => {
                    state.leftover.extend_from_slice(&scratch[..n]);
                    if self.drive(state, mux, env) == Step::Close {
                        return Step::Close;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(token = self.token, error = %e, "read failed");
                    return Step::Close;
                }
            }
        }

        Step::Continue
    }

    /// Feeds retained bytes to the current role until it needs more input
    /// or hands the connection to a writer or a worker.
    fn drive(self: &Arc<Self>, state: &mut ConnectionState, mux: &dyn Multiplexer, env: &Environment) -> Step {
        while state.phase == Phase::Reading && !state.leftover.is_empty() {
            let ctx = SessionContext {
                hosts: &env.hosts,
                limits: env.limits,
                handle: Some(self.handle()),
            };

            let (outcome, consumed) = state.protocol.process(&state.leftover, &ctx);
            let consumed = consumed.min(state.leftover.len());
            state.leftover.advance(consumed);

            match outcome {
                Outcome::NeedMore => {
                    if consumed == 0 {
                        break;
                    }
                }
                Outcome::Respond(reply) => {
                    stage_reply(state, reply);
                    if self.flush(state, mux) == Step::Close {
                        return Step::Close;
                    }
                }
                Outcome::Dispatch(item) => {
                    state.phase = Phase::Handling;
                    self.queue.push(item);
                    self.spawn_worker(env);
                }
                Outcome::Close => return Step::Close,
            }
        }

        Step::Continue
    }

    fn flush(&self, state: &mut ConnectionState, mux: &dyn Multiplexer) -> Step {
        if !state.out.is_empty() {
            let Some(transport) = state.transport.as_mut() else {
                return Step::Close;
            };

            match state.out.write_to(transport) {
                Ok(WriteStatus::Done) => {}
                Ok(WriteStatus::Pending) => {
                    self.set_interest(state, mux, Interest::READ | Interest::WRITE);
                    return Step::Continue;
                }
                Err(e) => {
                    debug!(token = self.token, error = %e, "write failed");
                    return Step::Close;
                }
            }
        }

        self.set_interest(state, mux, Interest::READ);

        if state.phase == Phase::Writing {
            self.after_write(state)
        } else {
            Step::Continue
        }
    }

    fn after_write(&self, state: &mut ConnectionState) -> Step {
        if !state.keep_alive {
            return Step::Close;
        }

        state.protocol.reset();
        if let Some(next) = state.pending_switch.take() {
            if !self.switch_protocol(state, next) {
                return Step::Close;
            }
        }

        state.phase = Phase::Reading;
        Step::Continue
    }

    fn switch_protocol(&self, state: &mut ConnectionState, next: Protocol) -> bool {
        let from = state.protocol.kind();
        let to = next.kind();

        if !from.can_switch_to(to) {
            warn!(token = self.token, %from, %to, "refused protocol switch");
            return false;
        }

        debug!(token = self.token, %from, %to, "protocol switch");
        state.protocol = next;
        true
    }

    fn handshake(&self, state: &mut ConnectionState, mux: &dyn Multiplexer, env: &Environment) -> Step {
        let Some(Transport::Tls { stream, session }) = state.transport.as_mut() else {
            return Step::Close;
        };

        match session.handshake(stream) {
            Ok(HandshakeStatus::Done) => {
                if let Some(name) = session.server_name() {
                    if env.hosts.find(name).is_none() {
                        warn!(token = self.token, sni = name, "no virtual host for server name");
                        return Step::Close;
                    }
                }
                self.set_interest(state, mux, Interest::READ);
                let next = Protocol::Http1(Http1Session::new(env.limits));
                if self.switch_protocol(state, next) {
                    Step::Continue
                } else {
                    Step::Close
                }
            }
            Ok(HandshakeStatus::WantRead) => {
                self.set_interest(state, mux, Interest::READ);
                Step::Continue
            }
            Ok(HandshakeStatus::WantWrite) => {
                self.set_interest(state, mux, Interest::READ | Interest::WRITE);
                Step::Continue
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Step::Continue,
            Err(e) => {
                debug!(token = self.token, error = %e, "tls handshake failed");
                Step::Close
            }
        }
    }

    fn set_interest(&self, state: &mut ConnectionState, mux: &dyn Multiplexer, interest: Interest) {
        if state.interest == interest {
            return;
        }
        if let Err(e) = mux.modify(self.fd, self.token, interest) {
            debug!(token = self.token, error = %e, "failed to change interest");
            return;
        }
        state.interest = interest;
    }

    fn spawn_worker(self: &Arc<Self>, env: &Environment) {
        let conn = Arc::clone(self);
        env.runtime.spawn_blocking(move || conn.run_queue());
    }

    fn run_queue(self: Arc<Self>) {
        while let Some(item) = self.queue.pop() {
            if self.is_destroyed() {
                continue;
            }

            let reply = item.run();

            let mut state = self.state.lock();
            if self.is_destroyed() {
                continue;
            }
            stage_reply(&mut state, reply);
        }

        if !self.is_destroyed() {
            self.signal.schedule(&self);
        }
    }

    /// Queues raw bytes behind whatever is already waiting to be written.
    fn enqueue(self: &Arc<Self>, bytes: &[u8]) -> bool {
        if self.is_destroyed() {
            return false;
        }
        {
            let mut state = self.state.lock();
            if state.transport.is_none() {
                return false;
            }
            state.out.push(bytes);
        }
        self.signal.schedule(self);
        true
    }
}

fn stage_reply(state: &mut ConnectionState, reply: Reply) {
    state.out.push(&reply.bytes);
    state.keep_alive = reply.keep_alive;
    state.pending_switch = reply.switch_to;
    state.phase = Phase::Writing;
}

/// Weak reference to a connection that application code may keep around,
/// e.g. to push WebSocket messages from a broadcast channel.
#[derive(Clone)]
pub struct ConnectionHandle {
    conn: Weak<Connection>,
}

impl ConnectionHandle {
    pub fn is_alive(&self) -> bool {
        self.conn.upgrade().is_some_and(|conn| !conn.is_destroyed())
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.conn.upgrade().map(|conn| conn.peer())
    }

    /// Queues already-framed bytes. Returns `false` once the connection is gone.
    pub fn send_raw(&self, bytes: &[u8]) -> bool {
        match self.conn.upgrade() {
            Some(conn) => conn.enqueue(bytes),
            None => false,
        }
    }

    /// Sends one unfragmented WebSocket message.
    pub fn send_message(&self, opcode: Opcode, payload: &[u8]) -> bool {
        let mut frame = BytesMut::with_capacity(payload.len() + 10);
        encode_frame(true, opcode, payload, &mut frame);
        self.send_raw(&frame)
    }

    pub fn send_text(&self, text: &str) -> bool {
        self.send_message(Opcode::Text, text.as_bytes())
    }
}

impl Subscriber for ConnectionHandle {
    fn deliver(&self, payload: &[u8]) -> bool {
        let opcode = if std::str::from_utf8(payload).is_ok() {
            Opcode::Text
        } else {
            Opcode::Binary
        };
        self.send_message(opcode, payload)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}
