//! WebSocket support (RFC 6455).
//!
//! - **`handshake`**: upgrade detection and `Sec-WebSocket-Accept`
//! - **`frame`**: frame header, opcodes, server-side encoder
//! - **`parser`**: incremental frame parser and message reassembly
//! - **`session`**: the protocol role a connection switches to after `101`

pub mod frame;
pub mod handshake;
pub mod parser;
pub mod session;

pub use session::{WsHandler, WsRequest, WsResponse, WsSession, ws_handler};
