//! Readiness multiplexer.
//!
//! The event loop only talks to the [`Multiplexer`] trait: register a file
//! descriptor, change what it waits for, unregister it, and wait for one
//! batch of events. [`mio_backend::MioMultiplexer`] is the bundled backend;
//! another OS facility can be dropped in without touching the parsers or the
//! connection code.
//!
//! Every backend also keeps a live-connection counter. It is shared by all
//! shards of a server so graceful shutdown can tell when the last
//! connection is gone.

pub mod mio_backend;

use std::fmt;
use std::io;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

pub use mio_backend::MioMultiplexer;

/// Identifies a registered descriptor in events.
pub type Token = usize;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READ: Interest = Interest(0b01);
    pub const WRITE: Interest = Interest(0b10);

    pub fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => f.write_str("READ | WRITE"),
            (true, false) => f.write_str("READ"),
            (false, true) => f.write_str("WRITE"),
            (false, false) => f.write_str("NONE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    /// Both directions closed by the peer.
    pub hangup: bool,
}

/// Wakes a blocked [`Multiplexer::wait`] from another thread.
pub trait Notify: Send + Sync {
    fn notify(&self) -> io::Result<()>;
}

pub trait Multiplexer: Send {
    /// Registers a connection and counts it as live.
    fn add(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Registers a listening socket. Listeners are not counted.
    fn add_listener(&self, fd: RawFd, token: Token) -> io::Result<()>;

    fn modify(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Unregisters a connection and decrements the live count.
    fn remove(&self, fd: RawFd) -> io::Result<()>;

    fn remove_listener(&self, fd: RawFd) -> io::Result<()>;

    /// Blocks for at most `timeout` and appends the ready events to `events`.
    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()>;

    /// Handle that interrupts `wait`; the wakeup arrives as an event carrying
    /// the token the backend was created with.
    fn notifier(&self) -> Arc<dyn Notify>;

    /// Live connections across every multiplexer sharing this counter.
    fn connection_count(&self) -> usize;
}
