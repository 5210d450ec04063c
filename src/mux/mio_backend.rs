use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Poll, Waker};

use super::{Event, Interest, Multiplexer, Notify, Token};

const EVENT_CAPACITY: usize = 1024;

/// Edge-triggered backend over `mio::Poll` (epoll on Linux, kqueue on BSDs).
///
/// Readers must drain until `WouldBlock`; `modify` re-arms the descriptor,
/// which reports any readiness that is already pending.
pub struct MioMultiplexer {
    poll: Poll,
    events: Events,
    waker: Arc<MioNotify>,
    live: Arc<AtomicUsize>,
}

struct MioNotify(Waker);

impl Notify for MioNotify {
    fn notify(&self) -> io::Result<()> {
        self.0.wake()
    }
}

impl MioMultiplexer {
    /// `wake_token` is reported when the notifier fires; `live` is the
    /// connection counter shared with the other shards.
    pub fn new(wake_token: Token, live: Arc<AtomicUsize>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), mio::Token(wake_token))?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            waker: Arc::new(MioNotify(waker)),
            live,
        })
    }
}

fn to_mio(interest: Interest) -> mio::Interest {
    match (interest.is_readable(), interest.is_writable()) {
        (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
        (false, true) => mio::Interest::WRITABLE,
        _ => mio::Interest::READABLE,
    }
}

impl Multiplexer for MioMultiplexer {
    fn add(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), mio::Token(token), to_mio(interest))?;
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn add_listener(&self, fd: RawFd, token: Token) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), mio::Token(token), mio::Interest::READABLE)
    }

    fn modify(&self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), mio::Token(token), to_mio(interest))
    }

    fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn remove_listener(&self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        events.extend(self.events.iter().map(|event| Event {
            token: event.token().0,
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable(),
            error: event.is_error(),
            hangup: event.is_read_closed() && event.is_write_closed(),
        }));
        Ok(())
    }

    fn notifier(&self) -> Arc<dyn Notify> {
        self.waker.clone()
    }

    fn connection_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}
