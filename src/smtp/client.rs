//! Blocking SMTP client.
//!
//! A fixed command/response sequence over one connection:
//!
//! ```text
//! connect ─▶ banner 220 ─▶ EHLO 250 ─▶ [STARTTLS 220 ─▶ TLS ─▶ EHLO 250]
//!         ─▶ MAIL FROM 250 ─▶ RCPT TO 250 ─▶ DATA 354 ─▶ content 250 ─▶ QUIT 221
//! ```
//!
//! Any unexpected status or I/O failure marks the client as reseted. Every
//! later command fails immediately; retrying means opening a new client.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::{Buf, BytesMut};
use tracing::{debug, info, warn};

use crate::config::MailConfig;
use crate::error::{ParseError, Progress};
use crate::protocol::ProtocolKind;
use crate::smtp::parser::ReplyParser;
use crate::tls::{Stream, TlsConnector};

/// Plain SMTP relay port.
pub const SMTP_PORT: u16 = 25;
/// Submission port, used with STARTTLS.
pub const SUBMISSION_PORT: u16 = 587;

/// Socket read/write timeout used by [`SmtpClient::connect`].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 1024;

#[derive(Debug)]
pub enum SmtpError {
    Io(io::Error),
    /// The server's reply did not follow the reply grammar.
    Protocol(ParseError),
    /// The server answered with an unexpected status.
    Status {
        command: &'static str,
        expected: u16,
        status: u16,
        message: String,
    },
    /// The server closed the connection.
    Closed,
    /// A previous failure or RSET ended this session.
    Reseted,
    /// The command is not valid in the client's current role.
    WrongState(ProtocolKind),
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpError::Io(e) => write!(f, "smtp i/o error: {}", e),
            SmtpError::Protocol(e) => write!(f, "malformed smtp reply: {}", e),
            SmtpError::Status {
                command,
                expected,
                status,
                message,
            } => write!(
                f,
                "{} expected {} but got {}: {}",
                command,
                expected,
                status,
                message.trim_end()
            ),
            SmtpError::Closed => write!(f, "smtp server closed the connection"),
            SmtpError::Reseted => write!(f, "smtp session was reset"),
            SmtpError::WrongState(role) => write!(f, "command not allowed in {} role", role),
        }
    }
}

impl std::error::Error for SmtpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SmtpError::Io(e) => Some(e),
            SmtpError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SmtpError {
    fn from(e: io::Error) -> Self {
        SmtpError::Io(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub status: u16,
    /// Final reply line, CRLF included.
    pub message: String,
    pub continuation: Vec<String>,
}

pub struct SmtpClient {
    stream: Option<Box<dyn Stream>>,
    host: String,
    parser: ReplyParser,
    pending: BytesMut,
    role: ProtocolKind,
    reseted: bool,
}

impl SmtpClient {
    /// Connects to `host:port` and reads the greeting banner.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, SmtpError> {
        let mut last_error = None;

        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    debug!(host, %addr, "smtp connected");
                    return Self::from_stream(host, Box::new(stream));
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(SmtpError::Io(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        })))
    }

    /// Wraps an established stream and reads the greeting banner.
    pub fn from_stream(host: &str, stream: Box<dyn Stream>) -> Result<Self, SmtpError> {
        let mut client = Self {
            stream: Some(stream),
            host: host.to_string(),
            parser: ReplyParser::new(),
            pending: BytesMut::new(),
            role: ProtocolKind::SmtpCommand,
            reseted: false,
        };

        let reply = client.read_reply()?;
        if reply.status != 220 && reply.status != 250 {
            return Err(client.fail_status("banner", 220, reply));
        }

        Ok(client)
    }

    pub fn role(&self) -> ProtocolKind {
        self.role
    }

    pub fn is_reseted(&self) -> bool {
        self.reseted
    }

    pub fn ehlo(&mut self, domain: &str) -> Result<SmtpReply, SmtpError> {
        self.command("EHLO", &format!("EHLO {}\r\n", domain), 250)
    }

    /// Issues STARTTLS, upgrades the stream through `connector` and greets
    /// the server again over the encrypted channel.
    pub fn starttls(&mut self, connector: &dyn TlsConnector, domain: &str) -> Result<SmtpReply, SmtpError> {
        self.command("STARTTLS", "STARTTLS\r\n", 220)?;
        self.switch(ProtocolKind::SmtpTls)?;

        let plain = self.stream.take().ok_or(SmtpError::Closed)?;
        match connector.connect(&self.host, plain) {
            Ok(secure) => self.stream = Some(secure),
            Err(e) => {
                self.reseted = true;
                warn!(host = %self.host, error = %e, "smtp tls handshake failed");
                return Err(SmtpError::Io(e));
            }
        }

        self.switch(ProtocolKind::SmtpCommand)?;
        self.ehlo(domain)
    }

    pub fn mail_from(&mut self, address: &str) -> Result<SmtpReply, SmtpError> {
        self.command("MAIL FROM", &format!("MAIL FROM: <{}>\r\n", address), 250)
    }

    pub fn rcpt_to(&mut self, address: &str) -> Result<SmtpReply, SmtpError> {
        self.command("RCPT TO", &format!("RCPT TO: <{}>\r\n", address), 250)
    }

    /// Sends DATA and moves to the content role.
    pub fn data(&mut self) -> Result<SmtpReply, SmtpError> {
        let reply = self.command("DATA", "DATA\r\n", 354)?;
        self.switch(ProtocolKind::SmtpContent)?;
        Ok(reply)
    }

    /// Sends the message with dot-stuffing and the terminating `.` line.
    pub fn content(&mut self, message: &[u8]) -> Result<SmtpReply, SmtpError> {
        self.ensure_ready()?;
        if self.role != ProtocolKind::SmtpContent {
            return Err(SmtpError::WrongState(self.role));
        }

        let encoded = dot_stuff(message);
        self.write_all(&encoded)?;

        let reply = self.read_reply()?;
        if reply.status != 250 {
            return Err(self.fail_status("content", 250, reply));
        }

        self.switch(ProtocolKind::SmtpCommand)?;
        Ok(reply)
    }

    /// Aborts the transaction. Only QUIT is accepted afterwards.
    pub fn rset(&mut self) -> Result<SmtpReply, SmtpError> {
        let reply = self.command("RSET", "RSET\r\n", 250)?;
        self.reseted = true;
        Ok(reply)
    }

    /// Ends the session. Allowed on any open stream, reseted or not.
    pub fn quit(&mut self) -> Result<SmtpReply, SmtpError> {
        if self.stream.is_none() {
            return Err(SmtpError::Closed);
        }
        let reply = self.exchange("QUIT", "QUIT\r\n", 221)?;
        self.stream = None;
        Ok(reply)
    }

    fn command(&mut self, name: &'static str, line: &str, expected: u16) -> Result<SmtpReply, SmtpError> {
        self.ensure_ready()?;
        if self.role != ProtocolKind::SmtpCommand {
            return Err(SmtpError::WrongState(self.role));
        }
        self.exchange(name, line, expected)
    }

    fn exchange(&mut self, name: &'static str, line: &str, expected: u16) -> Result<SmtpReply, SmtpError> {
        debug!(command = name, "smtp send");
        self.write_all(line.as_bytes())?;

        let reply = self.read_reply()?;
        if reply.status != expected {
            return Err(self.fail_status(name, expected, reply));
        }
        Ok(reply)
    }

    fn ensure_ready(&self) -> Result<(), SmtpError> {
        if self.reseted {
            return Err(SmtpError::Reseted);
        }
        if self.stream.is_none() {
            return Err(SmtpError::Closed);
        }
        Ok(())
    }

    fn switch(&mut self, next: ProtocolKind) -> Result<(), SmtpError> {
        if !self.role.can_switch_to(next) {
            self.reseted = true;
            return Err(SmtpError::WrongState(self.role));
        }
        self.role = next;
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SmtpError> {
        let stream = self.stream.as_mut().ok_or(SmtpError::Closed)?;
        let result = stream.write_all(bytes).and_then(|()| stream.flush());
        result.map_err(|e| self.fail(SmtpError::Io(e)))
    }

    fn read_reply(&mut self) -> Result<SmtpReply, SmtpError> {
        self.parser.reset();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if !self.pending.is_empty() {
                match self.parser.run(&self.pending) {
                    Ok(Progress::Complete { consumed }) => {
                        self.pending.advance(consumed);
                        return Ok(SmtpReply {
                            status: self.parser.status(),
                            message: self.parser.message().to_string(),
                            continuation: self.parser.continuation().to_vec(),
                        });
                    }
                    Ok(Progress::Continue) => self.pending.clear(),
                    Err(e) => return Err(self.fail(SmtpError::Protocol(e))),
                }
            }

            let stream = self.stream.as_mut().ok_or(SmtpError::Closed)?;
            match stream.read(&mut chunk) {
                Ok(0) => return Err(self.fail(SmtpError::Closed)),
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(SmtpError::Io(e))),
            }
        }
    }

    fn fail(&mut self, error: SmtpError) -> SmtpError {
        self.reseted = true;
        warn!(host = %self.host, error = %error, "smtp session failed");
        error
    }

    fn fail_status(&mut self, command: &'static str, expected: u16, reply: SmtpReply) -> SmtpError {
        self.fail(SmtpError::Status {
            command,
            expected,
            status: reply.status,
            message: reply.message,
        })
    }
}

/// Doubles leading dots and appends the `CRLF . CRLF` terminator.
pub fn dot_stuff(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 8);
    let mut line_start = true;

    for &b in message {
        if line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        line_start = b == b'\n';
    }

    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// Runs the whole delivery sequence for one recipient.
pub fn send_mail(
    config: &MailConfig,
    to: &str,
    message: &[u8],
    tls: Option<&dyn TlsConnector>,
) -> anyhow::Result<()> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let mut client = SmtpClient::connect(&config.host, config.port, timeout)
        .with_context(|| format!("failed to connect to {}:{}", config.host, config.port))?;

    client.ehlo(&config.ehlo_domain).context("EHLO rejected")?;

    if config.tls {
        let connector = tls.context("STARTTLS requested but no TLS connector is configured")?;
        client
            .starttls(connector, &config.ehlo_domain)
            .context("STARTTLS failed")?;
    }

    client.mail_from(&config.from).context("sender rejected")?;
    client.rcpt_to(to).context("recipient rejected")?;
    client.data().context("DATA rejected")?;
    client.content(message).context("message rejected")?;
    client.rset().context("RSET failed")?;
    client.quit().context("QUIT failed")?;

    info!(to, host = %config.host, "mail delivered");
    Ok(())
}

/// [`send_mail`] on tokio's blocking pool.
pub async fn send_mail_async(
    config: MailConfig,
    to: String,
    message: Vec<u8>,
    tls: Option<Arc<dyn TlsConnector>>,
) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || send_mail(&config, &to, &message, tls.as_deref()))
        .await
        .context("mail task failed")?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dot_stuffing() {
        assert_eq!(dot_stuff(b"hi\r\n.hidden\r\n"), b"hi\r\n..hidden\r\n.\r\n");
        assert_eq!(dot_stuff(b".start"), b"..start\r\n.\r\n");
    }
}
