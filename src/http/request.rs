use bytes::BytesMut;

use crate::error::ParseError;

/// HTTP request methods.
///
/// The parser accepts exactly these tokens; anything else is a bad request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
}

/// Longest method token the parser will accumulate.
pub const MAX_METHOD_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    #[default]
    None,
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentEncoding {
    #[default]
    None,
    Gzip,
}

/// Represents a parsed HTTP request from a client.
///
/// Headers keep their arrival order. `path` is the percent-decoded part of
/// `uri` before `?` or `#`, `ext` is the extension of its last segment and
/// `query` holds the decoded query pairs followed by any route parameters.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub path: String,
    pub ext: String,
    /// HTTP version (`HTTP/1.1` or `HTTP/1.0`)
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub content_length: usize,
    pub transfer_encoding: TransferEncoding,
    pub content_encoding: ContentEncoding,
    /// Host header value without the port.
    pub host: Option<String>,
    pub keep_alive: bool,
    pub body: BytesMut,
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    version: Option<String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// # Arguments
    ///
    /// * `s` - String representation of the method (case-sensitive)
    ///
    /// # Returns
    ///
    /// `Some(Method)` if the string matches a known method, `None` otherwise.
    ///
    /// # Example
    ///
    /// ```
    /// # use polyserve::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            uri: None,
            version: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        let mut request = Request::new();
        request.method = self.method.ok_or("method missing")?;
        let uri = self.uri.ok_or("uri missing")?;
        request.set_uri(&uri).map_err(|_| "invalid uri")?;
        request.version = self.version.unwrap_or_else(|| "HTTP/1.1".to_string());
        request.keep_alive = request.version == "HTTP/1.1";
        request.headers = self.headers;
        request.content_length = self.body.len();
        request.body = BytesMut::from(&self.body[..]);
        Ok(request)
    }
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub fn new() -> Self {
        Self {
            method: Method::GET,
            uri: String::new(),
            path: String::new(),
            ext: String::new(),
            version: String::new(),
            headers: Vec::new(),
            query: Vec::new(),
            cookies: Vec::new(),
            content_length: 0,
            transfer_encoding: TransferEncoding::None,
            content_encoding: ContentEncoding::None,
            host: None,
            keep_alive: false,
            body: BytesMut::new(),
        }
    }

    /// Replaces the URI and everything derived from it.
    ///
    /// The URI must start with `/`. The path is percent-decoded, the query
    /// string is split on `&` and `=` with keys lacking a value mapped to `""`.
    pub fn set_uri(&mut self, uri: &str) -> Result<(), ParseError> {
        if !uri.starts_with('/') {
            return Err(ParseError::BadRequest);
        }

        let path_end = uri.find(['?', '#']).unwrap_or(uri.len());
        let raw_path = &uri[..path_end];
        let path = percent_decode(raw_path).ok_or(ParseError::BadRequest)?;

        let query = match uri[path_end..].strip_prefix('?') {
            Some(rest) => {
                let end = rest.find('#').unwrap_or(rest.len());
                &rest[..end]
            }
            None => "",
        };

        self.query = url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        self.ext = extension(&path).to_string();
        self.path = path;
        self.uri = uri.to_string();

        Ok(())
    }

    /// Retrieves a header value by exact, case-sensitive name.
    ///
    /// # Arguments
    ///
    /// * `key` - Header name to look up
    ///
    /// # Returns
    ///
    /// The first matching value in arrival order, `None` when absent.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.len() == key.len() && k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First header whose name matches ignoring ASCII case.
    pub fn header_ignore_case(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn cookie(&self, key: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    /// Whether the connection should remain open after the response.
    ///
    /// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close; a `Connection`
    /// header overrides either.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Clears every field so the request can carry the next one.
    pub fn reset(&mut self) {
        self.method = Method::GET;
        self.uri.clear();
        self.path.clear();
        self.ext.clear();
        self.version.clear();
        self.headers.clear();
        self.query.clear();
        self.cookies.clear();
        self.content_length = 0;
        self.transfer_encoding = TransferEncoding::None;
        self.content_encoding = ContentEncoding::None;
        self.host = None;
        self.keep_alive = false;
        self.body.clear();
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

fn extension(path: &str) -> &str {
    let segment = path.rsplit('/').next().unwrap_or("");
    match segment.rfind('.') {
        Some(pos) => &segment[pos + 1..],
        None => "",
    }
}

/// Decodes `%XX` escapes. Returns `None` on a malformed escape or when the
/// decoded bytes are not UTF-8.
pub fn percent_decode(input: &str) -> Option<String> {
    if !input.contains('%') {
        return Some(input.to_string());
    }

    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len() {
                return None;
            }
            let hi = hex_digit(bytes[i + 1])?;
            let lo = hex_digit(bytes[i + 2])?;
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).ok()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
