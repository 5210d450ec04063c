use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

fn has_token(value: Option<&str>, token: &str) -> bool {
    value
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}

/// Whether the request asks for a version 13 WebSocket upgrade.
pub fn is_upgrade_request(request: &Request) -> bool {
    request.method == Method::GET
        && has_token(request.header_ignore_case("Upgrade"), "websocket")
        && has_token(request.header_ignore_case("Connection"), "upgrade")
        && request.header_ignore_case("Sec-WebSocket-Version").map(str::trim) == Some("13")
        && request.header_ignore_case("Sec-WebSocket-Key").is_some()
}

/// `101 Switching Protocols` answering `request`, or `None` if it carries no key.
pub fn upgrade_response(request: &Request) -> Option<Response> {
    let key = request.header_ignore_case("Sec-WebSocket-Key")?;

    Some(
        ResponseBuilder::new(StatusCode::SwitchingProtocols)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Accept", accept_key(key))
            .build(),
    )
}
