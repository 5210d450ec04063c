//! Protocol roles a connection can take and the points where it may switch.
//!
//! Server connections move between [`Protocol::Tls`], [`Protocol::Http1`]
//! and [`Protocol::WebSocket`]; the outbound SMTP client walks the
//! `Smtp*` kinds. Every switch is checked against
//! [`ProtocolKind::can_switch_to`].

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;

use crate::connection::ConnectionHandle;
use crate::connection::queue::WorkItem;
use crate::domain::HostTable;
use crate::http::connection::Http1Session;
use crate::http::parser::ParseLimits;
use crate::websocket::session::WsSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Tls,
    Http1,
    WebSocket,
    SmtpCommand,
    SmtpContent,
    SmtpTls,
}

impl ProtocolKind {
    /// Transition table. Anything not listed is refused.
    pub fn can_switch_to(self, next: ProtocolKind) -> bool {
        use ProtocolKind::*;

        matches!(
            (self, next),
            (Tls, Http1)
                | (Http1, Http1)
                | (Http1, WebSocket)
                | (SmtpCommand, SmtpTls)
                | (SmtpTls, SmtpCommand)
                | (SmtpCommand, SmtpContent)
                | (SmtpContent, SmtpCommand)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Tls => "tls",
            ProtocolKind::Http1 => "http1",
            ProtocolKind::WebSocket => "websocket",
            ProtocolKind::SmtpCommand => "smtp-command",
            ProtocolKind::SmtpContent => "smtp-content",
            ProtocolKind::SmtpTls => "smtp-tls",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything a role needs from its surroundings while consuming bytes.
pub struct SessionContext<'a> {
    pub hosts: &'a Arc<HostTable>,
    pub limits: ParseLimits,
    pub handle: Option<ConnectionHandle>,
}

/// Bytes to send plus what happens to the connection once they are out.
pub struct Reply {
    pub bytes: BytesMut,
    pub keep_alive: bool,
    /// Applied only after `bytes` are fully written.
    pub switch_to: Option<Protocol>,
}

impl Reply {
    pub fn new(bytes: BytesMut, keep_alive: bool) -> Self {
        Self {
            bytes,
            keep_alive,
            switch_to: None,
        }
    }
}

/// What the connection does after a role consumed bytes.
pub enum Outcome {
    /// Keep reading.
    NeedMore,
    /// Write a reply produced inline.
    Respond(Reply),
    /// Queue application work; reading pauses until its reply is written.
    Dispatch(WorkItem),
    /// Tear the connection down without a reply.
    Close,
}

pub enum Protocol {
    /// TLS handshake in progress below the transport.
    Tls,
    Http1(Http1Session),
    WebSocket(WsSession),
}

impl Protocol {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Protocol::Tls => ProtocolKind::Tls,
            Protocol::Http1(_) => ProtocolKind::Http1,
            Protocol::WebSocket(_) => ProtocolKind::WebSocket,
        }
    }

    /// Feeds bytes to the current role. Returns the outcome and how many
    /// bytes it consumed; the rest must be offered again later.
    pub fn process(&mut self, data: &[u8], ctx: &SessionContext<'_>) -> (Outcome, usize) {
        match self {
            // Handshake bytes never reach here; the transport consumes them.
            Protocol::Tls => (Outcome::NeedMore, data.len()),
            Protocol::Http1(session) => session.process(data, ctx),
            Protocol::WebSocket(session) => session.process(data, ctx),
        }
    }

    /// Keep-alive reset after a reply has been written.
    pub fn reset(&mut self) {
        match self {
            Protocol::Tls => {}
            Protocol::Http1(session) => session.reset(),
            Protocol::WebSocket(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ProtocolKind::*;

    #[test]
    fn switch_table() {
        assert!(Tls.can_switch_to(Http1));
        assert!(Http1.can_switch_to(WebSocket));
        assert!(!WebSocket.can_switch_to(Http1));
        assert!(!Tls.can_switch_to(WebSocket));
        assert!(SmtpCommand.can_switch_to(SmtpContent));
        assert!(!SmtpContent.can_switch_to(SmtpTls));
    }
}
