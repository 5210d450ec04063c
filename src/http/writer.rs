use std::io::{self, Write};

use bytes::{Buf, BufMut, BytesMut};

use crate::http::chunked::{encode_chunk, encode_last_chunk};
use crate::http::gzip;
use crate::http::request::{ContentEncoding, TransferEncoding};
use crate::http::response::{Response, StatusCode};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Serializes a response into wire bytes.
///
/// Gzip bodies are compressed first; chunked bodies are framed as a single
/// chunk followed by the terminal chunk. `head_only` drops the body but keeps
/// the headers describing it.
pub fn serialize_response(resp: &Response, keep_alive: bool, head_only: bool) -> io::Result<BytesMut> {
    let body = match resp.content_encoding {
        ContentEncoding::Gzip => BytesMut::from(&gzip::compress(&resp.body)?[..]),
        ContentEncoding::None => resp.body.clone(),
    };

    let mut buf = BytesMut::with_capacity(256 + body.len());

    // Status line
    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    buf.put_slice(status_line.as_bytes());

    // Headers
    for (k, v) in &resp.headers {
        put_header(&mut buf, k, v);
    }

    let bodyless = matches!(resp.status, StatusCode::SwitchingProtocols | StatusCode::NoContent);
    let chunked = resp.transfer_encoding == TransferEncoding::Chunked && !bodyless;

    if resp.status != StatusCode::SwitchingProtocols {
        put_header(&mut buf, "Connection", if keep_alive { "keep-alive" } else { "close" });
    }
    if resp.content_encoding == ContentEncoding::Gzip {
        put_header(&mut buf, "Content-Encoding", "gzip");
    }
    if chunked {
        put_header(&mut buf, "Transfer-Encoding", "chunked");
    } else if !bodyless {
        put_header(&mut buf, "Content-Length", &body.len().to_string());
    }

    // Header/body separator
    buf.put_slice(b"\r\n");

    if head_only || bodyless {
        return Ok(buf);
    }

    if chunked {
        encode_chunk(&body, &mut buf);
        encode_last_chunk(&mut buf);
    } else {
        buf.put_slice(&body);
    }

    Ok(buf)
}

fn put_header(buf: &mut BytesMut, key: &str, value: &str) {
    buf.put_slice(key.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Everything queued so far reached the socket.
    Done,
    /// The socket would block; wait for writability.
    Pending,
}

/// Outbound byte queue flushed to a non-blocking socket.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    buffer: BytesMut,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Writes until the queue is empty or the socket would block.
    pub fn write_to<W: Write + ?Sized>(&mut self, stream: &mut W) -> io::Result<WriteStatus> {
        while !self.buffer.is_empty() {
            match stream.write(&self.buffer) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection closed while writing",
                    ));
                }
                Ok(n) => self.buffer.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(WriteStatus::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(WriteStatus::Done)
    }
}
