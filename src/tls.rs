//! TLS hooks.
//!
//! No TLS library is bundled. A deployment plugs one in by implementing
//! [`TlsAcceptor`] for server listeners and [`TlsConnector`] for the SMTP
//! client's STARTTLS upgrade. Parsers never see the difference: the
//! connection's transport decrypts below `read` and encrypts below `write`.

use std::io::{self, Read, Write};

/// Anything a TLS session can drive records over.
pub trait ReadWrite: Read + Write {}

impl<T: Read + Write + ?Sized> ReadWrite for T {}

/// Blocking byte stream used by the SMTP client, plain or encrypted.
pub trait Stream: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> Stream for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    Done,
    /// Call again once the socket is readable.
    WantRead,
    /// Call again once the socket is writable.
    WantWrite,
}

/// Server side of one TLS connection, driven over a non-blocking socket.
pub trait TlsSession: Send {
    fn handshake(&mut self, io: &mut dyn ReadWrite) -> io::Result<HandshakeStatus>;

    /// SNI name sent by the client, available once the handshake is done.
    fn server_name(&self) -> Option<&str>;

    /// Reads decrypted application data. `WouldBlock` means no full record yet.
    fn read(&mut self, io: &mut dyn ReadWrite, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, io: &mut dyn ReadWrite, buf: &[u8]) -> io::Result<usize>;

    /// Queues a close_notify. Errors are ignored by callers.
    fn close(&mut self, _io: &mut dyn ReadWrite) {}
}

/// Creates a session for every connection accepted on a TLS listener.
pub trait TlsAcceptor: Send + Sync {
    fn accept(&self) -> io::Result<Box<dyn TlsSession>>;
}

/// Client side upgrade of an established, blocking stream.
pub trait TlsConnector: Send + Sync {
    fn connect(&self, server_name: &str, stream: Box<dyn Stream>) -> io::Result<Box<dyn Stream>>;
}
