use bytes::BytesMut;

use crate::buffer::ByteAccumulator;
use crate::http::chunked::{ChunkedDecoder, PayloadSink};
use crate::http::cookie::parse_cookies;
use crate::http::gzip::Inflater;
use crate::http::request::{ContentEncoding, MAX_METHOD_LEN, Method, Request, TransferEncoding};

pub use crate::error::{ParseError, Progress};

/// Longest protocol token, `HTTP/1.1`.
const MAX_PROTOCOL_LEN: usize = 8;

/// Position of the request parser within the HTTP/1.x grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Method,
    Uri,
    Protocol,
    Newline1,
    HeaderKey,
    HeaderSpace,
    HeaderValue,
    Newline2,
    Newline3,
    Payload,
    Complete,
}

/// Size bounds enforced while parsing.
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_body_size: usize,
    pub max_uri_size: usize,
    pub max_header_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_body_size: 8 * 1024 * 1024,
            max_uri_size: 8192,
            max_header_size: 8192,
        }
    }
}

/// Maps a Host header value to a virtual host index.
pub trait HostResolver {
    fn resolve(&self, host: &str) -> Option<usize>;
}

/// Resolver that accepts every host as virtual host 0.
pub struct AnyHost;

impl HostResolver for AnyHost {
    fn resolve(&self, _host: &str) -> Option<usize> {
        Some(0)
    }
}

/// Incremental HTTP/1.x request parser.
///
/// Bytes may arrive split at any position; [`run`](RequestParser::run)
/// keeps its stage and the partial token between calls. Once it returns
/// [`Progress::Complete`] the request is available through
/// [`take_request`](RequestParser::take_request), which also readies the
/// parser for the next request on the connection.
pub struct RequestParser {
    stage: Stage,
    buf: ByteAccumulator,
    header_key: String,
    limits: ParseLimits,
    request: Request,
    vhost: Option<usize>,
    chunked: ChunkedDecoder,
    inflater: Option<Inflater>,
    body_read: usize,
    connection_override: Option<bool>,
    has_content_length: bool,
}

impl RequestParser {
    pub fn new(limits: ParseLimits) -> Self {
        Self {
            stage: Stage::Method,
            buf: ByteAccumulator::new(),
            header_key: String::new(),
            limits,
            request: Request::new(),
            vhost: None,
            chunked: ChunkedDecoder::new(),
            inflater: None,
            body_read: 0,
            connection_override: None,
            has_content_length: false,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Virtual host matched by the Host header.
    pub fn vhost(&self) -> Option<usize> {
        self.vhost
    }

    /// Hands out the parsed request and resets the parser.
    pub fn take_request(&mut self) -> Request {
        let request = std::mem::take(&mut self.request);
        self.reset();
        request
    }

    pub fn reset(&mut self) {
        self.stage = Stage::Method;
        self.buf.reset();
        self.header_key.clear();
        self.request.reset();
        self.vhost = None;
        self.chunked.reset();
        self.inflater = None;
        self.body_read = 0;
        self.connection_override = None;
        self.has_content_length = false;
    }

    /// Feeds the next slice of bytes.
    ///
    /// Returns `Continue` when every byte was consumed without finishing the
    /// request, or `Complete` with the number of bytes that belong to it.
    /// Whatever follows belongs to the next pipelined request.
    pub fn run(&mut self, data: &[u8], hosts: &dyn HostResolver) -> Result<Progress, ParseError> {
        if self.stage == Stage::Complete {
            return Ok(Progress::Complete { consumed: 0 });
        }

        let mut pos = 0;

        while pos < data.len() {
            if self.stage == Stage::Payload {
                return match self.read_payload(&data[pos..])? {
                    Progress::Continue => Ok(Progress::Continue),
                    Progress::Complete { consumed } => {
                        self.stage = Stage::Complete;
                        Ok(Progress::Complete { consumed: pos + consumed })
                    }
                };
            }

            let ch = data[pos];
            pos += 1;

            match self.stage {
                Stage::Method => {
                    if ch == b' ' {
                        let token = self.take_token()?;
                        self.request.method =
                            Method::from_str(&token).ok_or(ParseError::BadRequest)?;
                        self.stage = Stage::Uri;
                    } else if (ch == b'\r' || ch == b'\n') && self.buf.is_empty() {
                        // stray CRLF between pipelined requests
                    } else if self.buf.written() >= MAX_METHOD_LEN || !ch.is_ascii_uppercase() {
                        return Err(ParseError::BadRequest);
                    } else {
                        self.buf.push(ch)?;
                    }
                }
                Stage::Uri => {
                    if ch == b' ' {
                        let uri = self.take_token()?;
                        self.request.set_uri(&uri)?;
                        self.stage = Stage::Protocol;
                    } else if ch.is_ascii_control() {
                        return Err(ParseError::BadRequest);
                    } else if self.buf.written() >= self.limits.max_uri_size {
                        return Err(ParseError::BadRequest);
                    } else {
                        self.buf.push(ch)?;
                    }
                }
                Stage::Protocol => {
                    if ch == b'\r' {
                        let version = self.take_token()?;
                        if version != "HTTP/1.1" && version != "HTTP/1.0" {
                            return Err(ParseError::BadRequest);
                        }
                        self.request.version = version;
                        self.stage = Stage::Newline1;
                    } else if self.buf.written() >= MAX_PROTOCOL_LEN {
                        return Err(ParseError::BadRequest);
                    } else {
                        self.buf.push(ch)?;
                    }
                }
                Stage::Newline1 => {
                    if ch != b'\n' {
                        return Err(ParseError::BadRequest);
                    }
                    self.stage = Stage::HeaderKey;
                }
                Stage::HeaderKey => {
                    if ch == b'\r' {
                        if !self.buf.is_empty() {
                            return Err(ParseError::BadRequest);
                        }
                        self.stage = Stage::Newline3;
                    } else if ch == b':' {
                        if self.buf.is_empty() {
                            return Err(ParseError::BadRequest);
                        }
                        self.header_key = self.take_token()?;
                        self.stage = Stage::HeaderSpace;
                    } else if ch.is_ascii_control() || ch == b' ' {
                        return Err(ParseError::BadRequest);
                    } else if self.buf.written() >= self.limits.max_header_size {
                        return Err(ParseError::BadRequest);
                    } else {
                        self.buf.push(ch)?;
                    }
                }
                Stage::HeaderSpace => {
                    if ch == b' ' {
                        self.stage = Stage::HeaderValue;
                    } else if ch == b'\r' {
                        self.add_header(String::new(), hosts)?;
                        self.stage = Stage::Newline2;
                    } else {
                        return Err(ParseError::BadRequest);
                    }
                }
                Stage::HeaderValue => {
                    if ch == b'\r' {
                        let value = self.take_token()?;
                        self.add_header(value, hosts)?;
                        self.stage = Stage::Newline2;
                    } else if ch == b'\n' {
                        return Err(ParseError::BadRequest);
                    } else if self.buf.written() >= self.limits.max_header_size {
                        return Err(ParseError::BadRequest);
                    } else {
                        self.buf.push(ch)?;
                    }
                }
                Stage::Newline2 => {
                    if ch != b'\n' {
                        return Err(ParseError::BadRequest);
                    }
                    self.stage = Stage::HeaderKey;
                }
                Stage::Newline3 => {
                    if ch != b'\n' {
                        return Err(ParseError::BadRequest);
                    }
                    if self.finish_headers()? {
                        self.stage = Stage::Complete;
                        return Ok(Progress::Complete { consumed: pos });
                    }
                    self.stage = Stage::Payload;
                }
                Stage::Payload | Stage::Complete => unreachable!("handled before byte dispatch"),
            }
        }

        Ok(Progress::Continue)
    }

    fn take_token(&mut self) -> Result<String, ParseError> {
        self.buf.complete()?;
        let token = self.buf.as_str().ok_or(ParseError::BadRequest)?.to_string();
        self.buf.reset();
        Ok(token)
    }

    fn add_header(&mut self, value: String, hosts: &dyn HostResolver) -> Result<(), ParseError> {
        let key = std::mem::take(&mut self.header_key);

        if key.eq_ignore_ascii_case("host") {
            let name = strip_port(&value);
            self.vhost = Some(hosts.resolve(name).ok_or(ParseError::HostNotFound)?);
            self.request.host = Some(name.to_string());
        } else if key.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(str::trim) {
                if token.eq_ignore_ascii_case("keep-alive") {
                    self.connection_override = Some(true);
                } else if token.eq_ignore_ascii_case("close") {
                    self.connection_override = Some(false);
                }
            }
        } else if key.eq_ignore_ascii_case("content-length") {
            let digits = value.trim();
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::BadRequest);
            }
            let length: usize = digits.parse().map_err(|_| ParseError::BadRequest)?;
            if self.has_content_length && length != self.request.content_length {
                return Err(ParseError::BadRequest);
            }
            self.request.content_length = length;
            self.has_content_length = true;
        } else if key.eq_ignore_ascii_case("transfer-encoding") {
            let mut codings = value.split(',').map(str::trim).filter(|c| !c.is_empty());
            let last = codings.next_back().ok_or(ParseError::BadRequest)?;
            if !last.eq_ignore_ascii_case("chunked") {
                return Err(ParseError::BadRequest);
            }
            for coding in codings {
                if coding.eq_ignore_ascii_case("gzip") {
                    self.request.content_encoding = ContentEncoding::Gzip;
                } else {
                    return Err(ParseError::BadRequest);
                }
            }
            self.request.transfer_encoding = TransferEncoding::Chunked;
        } else if key.eq_ignore_ascii_case("content-encoding") {
            if value.trim().eq_ignore_ascii_case("gzip") {
                self.request.content_encoding = ContentEncoding::Gzip;
            }
        } else if key.eq_ignore_ascii_case("cookie") {
            let cookies = parse_cookies(&value)?;
            self.request.cookies.extend(cookies);
        }

        self.request.headers.push((key, value));
        Ok(())
    }

    /// Classifies body handling. Returns `true` when the request has no body.
    fn finish_headers(&mut self) -> Result<bool, ParseError> {
        if self.request.host.is_none() {
            return Err(ParseError::HostNotFound);
        }

        self.request.keep_alive = self
            .connection_override
            .unwrap_or(self.request.version == "HTTP/1.1");

        let chunked = self.request.transfer_encoding == TransferEncoding::Chunked;
        if chunked && self.has_content_length {
            return Err(ParseError::BadRequest);
        }
        if !chunked && self.request.content_length == 0 {
            return Ok(true);
        }
        if self.request.content_length > self.limits.max_body_size {
            return Err(ParseError::PayloadTooLarge);
        }
        if self.request.content_encoding == ContentEncoding::Gzip {
            self.inflater = Some(Inflater::new());
        }

        Ok(false)
    }

    fn read_payload(&mut self, data: &[u8]) -> Result<Progress, ParseError> {
        let mut sink = BodySink {
            body: &mut self.request.body,
            inflater: self.inflater.as_mut(),
            limit: self.limits.max_body_size,
        };

        if self.request.transfer_encoding == TransferEncoding::Chunked {
            let progress = self.chunked.run(data, &mut sink)?;
            if progress.is_complete() {
                sink.finish()?;
            }
            return Ok(progress);
        }

        let wanted = self.request.content_length - self.body_read;
        let take = wanted.min(data.len());
        sink.append(&data[..take])?;
        self.body_read += take;

        if self.body_read < self.request.content_length {
            return Ok(Progress::Continue);
        }

        sink.finish()?;
        Ok(Progress::Complete { consumed: take })
    }
}

struct BodySink<'a> {
    body: &'a mut BytesMut,
    inflater: Option<&'a mut Inflater>,
    limit: usize,
}

impl BodySink<'_> {
    fn finish(&mut self) -> Result<(), ParseError> {
        let BodySink { body, inflater, limit } = self;
        let limit = *limit;
        match inflater {
            Some(inflater) => inflater.finish(|out| append_bounded(body, out, limit)),
            None => Ok(()),
        }
    }
}

impl PayloadSink for BodySink<'_> {
    fn append(&mut self, bytes: &[u8]) -> Result<(), ParseError> {
        let BodySink { body, inflater, limit } = self;
        let limit = *limit;
        match inflater {
            Some(inflater) => inflater.inflate(bytes, |out| append_bounded(body, out, limit)),
            None => append_bounded(body, bytes, limit),
        }
    }
}

fn append_bounded(body: &mut BytesMut, bytes: &[u8], limit: usize) -> Result<(), ParseError> {
    if body.len() + bytes.len() > limit {
        return Err(ParseError::PayloadTooLarge);
    }
    body.extend_from_slice(bytes);
    Ok(())
}

/// Drops a trailing `:port` from a Host value, keeping IPv6 brackets intact.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}
