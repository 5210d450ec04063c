//! One event loop: a thread, a multiplexer, and the connections it accepted.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{Connection, Environment, ShardSignal, Transport};
use crate::http::connection::Http1Session;
use crate::mux::{Event, Interest, Multiplexer, Notify, Token};
use crate::protocol::Protocol;
use crate::server::listener;
use crate::tls::TlsAcceptor;

pub(crate) const LISTENER: Token = usize::MAX - 1;
pub(crate) const WAKER: Token = usize::MAX;

/// Connection table indexed by token. Freed tokens are reused.
#[derive(Default)]
struct Slots {
    entries: Vec<Option<Arc<Connection>>>,
    free: Vec<Token>,
    len: usize,
}

impl Slots {
    fn next_token(&self) -> Token {
        self.free.last().copied().unwrap_or(self.entries.len())
    }

    fn insert(&mut self, conn: Arc<Connection>) {
        let token = conn.token();
        if self.free.last() == Some(&token) {
            self.free.pop();
        }
        if token == self.entries.len() {
            self.entries.push(None);
        }
        self.entries[token] = Some(conn);
        self.len += 1;
    }

    fn get(&self, token: Token) -> Option<&Arc<Connection>> {
        self.entries.get(token).and_then(Option::as_ref)
    }

    fn remove(&mut self, token: Token) -> Option<Arc<Connection>> {
        let conn = self.entries.get_mut(token)?.take()?;
        self.free.push(token);
        self.len -= 1;
        Some(conn)
    }

    fn drain(&mut self) -> Vec<Arc<Connection>> {
        self.free.clear();
        self.len = 0;
        self.entries.drain(..).flatten().collect()
    }

    fn len(&self) -> usize {
        self.len
    }
}

pub struct Shard {
    id: usize,
    mux: Box<dyn Multiplexer>,
    listener: Option<mio::net::TcpListener>,
    slots: Slots,
    signal: Arc<ShardSignal>,
    env: Arc<Environment>,
    tls: Option<Arc<dyn TlsAcceptor>>,
    scratch: Vec<u8>,
    poll_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Shard {
    pub fn new(
        id: usize,
        mux: Box<dyn Multiplexer>,
        listener: mio::net::TcpListener,
        env: Arc<Environment>,
        tls: Option<Arc<dyn TlsAcceptor>>,
        config: &Config,
    ) -> io::Result<Self> {
        mux.add_listener(listener.as_raw_fd(), LISTENER)?;
        let signal = Arc::new(ShardSignal::new(mux.notifier()));

        Ok(Self {
            id,
            mux,
            listener: Some(listener),
            slots: Slots::default(),
            signal,
            env,
            tls,
            scratch: vec![0; config.read_buffer_size.max(1024)],
            poll_timeout: Duration::from_millis(config.poll_timeout_ms.max(1)),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        })
    }

    pub fn notifier(&self) -> Arc<dyn Notify> {
        self.mux.notifier()
    }

    /// Runs until `shutdown` is set and the live connections are gone or the
    /// shutdown timeout expires.
    pub fn run(mut self, shutdown: &AtomicBool) -> io::Result<()> {
        let mut events = Vec::with_capacity(256);
        let mut deadline = None;

        debug!(shard = self.id, "event loop started");

        loop {
            if deadline.is_none() && shutdown.load(Ordering::Acquire) {
                self.stop_accepting();
                deadline = Some(Instant::now() + self.shutdown_timeout);
                info!(
                    shard = self.id,
                    live = self.mux.connection_count(),
                    "draining connections"
                );
            }

            if let Some(deadline) = deadline {
                if self.mux.connection_count() == 0 {
                    break;
                }
                if Instant::now() >= deadline {
                    warn!(shard = self.id, remaining = self.slots.len(), "shutdown timeout, closing connections");
                    break;
                }
            }

            events.clear();
            self.mux.wait(Some(self.poll_timeout), &mut events)?;

            for event in &events {
                match event.token {
                    LISTENER => self.accept(),
                    WAKER => self.drain_ready(),
                    _ => self.dispatch(event),
                }
            }
        }

        self.close_all();
        debug!(shard = self.id, "event loop stopped");
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };

            match listener::accept(listener) {
                Ok(Some((stream, peer))) => self.register(stream, peer),
                Ok(None) => return,
                Err(e) => {
                    warn!(shard = self.id, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn register(&mut self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let (transport, protocol) = match &self.tls {
            Some(acceptor) => match acceptor.accept() {
                Ok(session) => (Transport::Tls { stream, session }, Protocol::Tls),
                Err(e) => {
                    warn!(%peer, error = %e, "failed to start tls session");
                    return;
                }
            },
            None => (
                Transport::Plain(stream),
                Protocol::Http1(Http1Session::new(self.env.limits)),
            ),
        };

        let token = self.slots.next_token();
        let conn = Connection::new(token, transport, peer, protocol, Arc::clone(&self.signal));

        if let Err(e) = self.mux.add(conn.fd(), token, Interest::READ) {
            warn!(%peer, error = %e, "failed to register connection");
            return;
        }

        debug!(shard = self.id, token, %peer, "accepted connection");
        self.slots.insert(conn);
    }

    fn dispatch(&mut self, event: &Event) {
        let Some(conn) = self.slots.get(event.token).cloned() else {
            return;
        };

        if event.error || event.hangup {
            conn.close(&*self.mux);
        } else {
            conn.on_event(event.readable, event.writable, &*self.mux, &self.env, &mut self.scratch);
        }

        if conn.is_destroyed() {
            self.slots.remove(event.token);
        }
    }

    /// Flushes connections that workers or broadcasts queued output for.
    fn drain_ready(&mut self) {
        for weak in self.signal.drain() {
            let Some(conn) = weak.upgrade() else {
                continue;
            };
            // The token may have been reused since the work was queued.
            match self.slots.get(conn.token()) {
                Some(current) if Arc::ptr_eq(current, &conn) => {}
                _ => continue,
            }

            conn.on_ready(&*self.mux, &self.env, &mut self.scratch);
            if conn.is_destroyed() {
                self.slots.remove(conn.token());
            }
        }
    }

    fn stop_accepting(&mut self) {
        if let Some(listener) = self.listener.take() {
            if let Err(e) = self.mux.remove_listener(listener.as_raw_fd()) {
                debug!(shard = self.id, error = %e, "failed to unregister listener");
            }
        }
    }

    fn close_all(&mut self) {
        self.stop_accepting();
        for conn in self.slots.drain() {
            conn.close(&*self.mux);
        }
    }
}
