//! Polyserve - multi-protocol event-driven server
//!
//! Incremental parsers for HTTP/1.x, chunked transfer coding, WebSocket
//! frames, SMTP replies and cookies, driven by sharded readiness loops
//! that switch a connection between protocol roles.

pub mod broadcast;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod domain;
pub mod error;
pub mod http;
pub mod mux;
pub mod protocol;
pub mod server;
pub mod smtp;
pub mod tls;
pub mod websocket;
