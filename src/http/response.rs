use bytes::BytesMut;

use crate::error::ParseError;
use crate::http::request::{ContentEncoding, TransferEncoding};

/// HTTP status codes produced by the server.
///
/// - `SwitchingProtocols` (101): WebSocket upgrade accepted
/// - `MovedPermanently` (301): redirect rule with an external destination
/// - `PayloadTooLarge` (413): body above `client_max_body_size`
/// - `LoopDetected` (508): redirect rules rewrote the URI too many times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 101 Switching Protocols
    SwitchingProtocols,
    /// 200 OK
    Ok,
    /// 201 Created
    Created,
    /// 204 No Content
    NoContent,
    /// 301 Moved Permanently
    MovedPermanently,
    /// 400 Bad Request
    BadRequest,
    /// 404 Not Found
    NotFound,
    /// 405 Method Not Allowed
    MethodNotAllowed,
    /// 413 Payload Too Large
    PayloadTooLarge,
    /// 500 Internal Server Error
    InternalServerError,
    /// 508 Loop Detected
    LoopDetected,
}

impl StatusCode {
    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use polyserve::http::response::StatusCode;
    /// assert_eq!(StatusCode::Ok.as_u16(), 200);
    /// assert_eq!(StatusCode::LoopDetected.as_u16(), 508);
    /// ```
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::SwitchingProtocols => 101,
            StatusCode::Ok => 200,
            StatusCode::Created => 201,
            StatusCode::NoContent => 204,
            StatusCode::MovedPermanently => 301,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::MethodNotAllowed => 405,
            StatusCode::PayloadTooLarge => 413,
            StatusCode::InternalServerError => 500,
            StatusCode::LoopDetected => 508,
        }
    }

    /// Returns the standard HTTP reason phrase for this status code.
    pub fn reason_phrase(&self) -> &'static str {
        match self {
            StatusCode::SwitchingProtocols => "Switching Protocols",
            StatusCode::Ok => "OK",
            StatusCode::Created => "Created",
            StatusCode::NoContent => "No Content",
            StatusCode::MovedPermanently => "Moved Permanently",
            StatusCode::BadRequest => "Bad Request",
            StatusCode::NotFound => "Not Found",
            StatusCode::MethodNotAllowed => "Method Not Allowed",
            StatusCode::PayloadTooLarge => "Payload Too Large",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::LoopDetected => "Loop Detected",
        }
    }
}

impl From<ParseError> for StatusCode {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::BadRequest => StatusCode::BadRequest,
            ParseError::HostNotFound => StatusCode::NotFound,
            ParseError::PayloadTooLarge => StatusCode::PayloadTooLarge,
            ParseError::OutOfMemory => StatusCode::InternalServerError,
            ParseError::RedirectLoop => StatusCode::LoopDetected,
        }
    }
}

/// An HTTP response on its way to the client.
///
/// Headers keep insertion order. `Content-Length`, `Transfer-Encoding`,
/// `Content-Encoding` and `Connection` are written by the serializer from
/// the fields below and should not be set by hand.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: BytesMut,
    pub transfer_encoding: TransferEncoding,
    pub content_encoding: ContentEncoding,
}

/// Builder for constructing HTTP responses in a fluent style.
///
/// # Example
///
/// ```ignore
/// let response = ResponseBuilder::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(b"{}".to_vec())
///     .build();
/// ```
pub struct ResponseBuilder {
    response: Response,
}

impl ResponseBuilder {
    /// Creates a new response builder with the specified status code.
    pub fn new(status: StatusCode) -> Self {
        Self {
            response: Response::new(status),
        }
    }

    /// Adds or replaces a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.response.set_header(key, value);
        self
    }

    /// Sets the response body.
    pub fn body(mut self, body: impl AsRef<[u8]>) -> Self {
        self.response.body = BytesMut::from(body.as_ref());
        self
    }

    pub fn chunked(mut self) -> Self {
        self.response.transfer_encoding = TransferEncoding::Chunked;
        self
    }

    pub fn gzip(mut self) -> Self {
        self.response.content_encoding = ContentEncoding::Gzip;
        self
    }

    /// Builds the final Response.
    pub fn build(self) -> Response {
        self.response
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: BytesMut::new(),
            transfer_encoding: TransferEncoding::None,
            content_encoding: ContentEncoding::None,
        }
    }

    /// Creates a simple 200 OK response with the given body.
    pub fn ok(body: impl AsRef<[u8]>) -> Self {
        ResponseBuilder::new(StatusCode::Ok).body(body).build()
    }

    /// Canned response whose body is the status line text, e.g. `404 Not Found`.
    pub fn status(status: StatusCode) -> Self {
        let body = format!("{} {}", status.as_u16(), status.reason_phrase());
        ResponseBuilder::new(status)
            .header("Content-Type", "text/plain")
            .body(body)
            .build()
    }

    /// Creates a 404 Not Found response.
    pub fn not_found() -> Self {
        Self::status(StatusCode::NotFound)
    }

    /// Creates a 500 Internal Server Error response.
    pub fn internal_error() -> Self {
        Self::status(StatusCode::InternalServerError)
    }

    pub fn redirect(location: &str) -> Self {
        ResponseBuilder::new(StatusCode::MovedPermanently)
            .header("Location", location)
            .build()
    }

    pub fn from_error(err: ParseError) -> Self {
        Self::status(err.into())
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            Some(entry) => entry.1 = value,
            None => self.headers.push((key, value)),
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Appends bytes to the body.
    pub fn write(&mut self, data: impl AsRef<[u8]>) {
        self.body.extend_from_slice(data.as_ref());
    }
}
