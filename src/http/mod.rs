//! HTTP/1.x protocol implementation.
//!
//! # Architecture
//!
//! - **`parser`**: incremental request parser, resumable at any byte
//! - **`chunked`**: chunked transfer decoder and encoder
//! - **`gzip`**: streaming inflate/deflate used by the parser and writer
//! - **`cookie`**: `Cookie` header sub-parser
//! - **`request`**: request representation, URI and query decoding
//! - **`response`**: response representation with builder pattern
//! - **`writer`**: response serialization and non-blocking output queue
//! - **`route`**: path templates and method dispatch
//! - **`redirect`**: rewrite rules with a hop limit
//! - **`connection`**: the protocol role tying the above together
//!
//! # Request lifecycle
//!
//! ```text
//!        ┌─────────────┐
//!        │   Parsing   │ ← bytes arrive in any split; parser resumes
//!        └──────┬──────┘
//!               │ Complete { consumed }
//!               ▼
//!        ┌──────────────────┐
//!        │    Resolving     │ ← redirects, then upgrade or route lookup
//!        └──────┬───────────┘
//!               │ inline reply or queued handler
//!               ▼
//!        ┌──────────────────┐
//!        │    Writing       │ ← serialized response leaves the socket
//!        └──────┬───────────┘
//!               │ flushed
//!               ├─ Keep-Alive → Parsing (leftover bytes first)
//!               ├─ 101 → WebSocket role
//!               └─ Close → Closed
//! ```
//!
//! # Example
//!
//! ```ignore
//! use polyserve::http::parser::{AnyHost, ParseLimits, RequestParser};
//!
//! let mut parser = RequestParser::new(ParseLimits::default());
//! let progress = parser.run(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n", &AnyHost)?;
//! assert!(progress.is_complete());
//! ```

pub mod chunked;
pub mod connection;
pub mod cookie;
pub mod gzip;
pub mod parser;
pub mod redirect;
pub mod request;
pub mod response;
pub mod route;
pub mod writer;
