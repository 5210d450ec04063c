//! WebSocket protocol role, entered after a successful upgrade.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::connection::queue::WorkItem;
use crate::error::Progress;
use crate::protocol::{Outcome, Reply, SessionContext};
use crate::websocket::frame::{CLOSE_PROTOCOL_ERROR, Opcode, close_payload, encode_frame};
use crate::websocket::parser::{FrameParser, MessageBuffer};

/// Application handler for a WebSocket route.
pub type WsHandler = Arc<dyn Fn(&WsRequest, &mut WsResponse) + Send + Sync>;

/// Wraps a closure as a [`WsHandler`].
pub fn ws_handler<F>(f: F) -> WsHandler
where
    F: Fn(&WsRequest, &mut WsResponse) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One complete message received from the client.
pub struct WsRequest {
    /// `Text` or `Binary`, from the frame that opened the message.
    pub opcode: Opcode,
    pub payload: Bytes,
    /// Path and query of the upgrade request.
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Handle for pushing frames later, e.g. from a broadcast channel.
    pub connection: Option<ConnectionHandle>,
}

impl WsRequest {
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Frames a handler wants sent back.
#[derive(Debug, Default)]
pub struct WsResponse {
    frames: Vec<(Opcode, Vec<u8>)>,
    close: bool,
}

impl WsResponse {
    pub fn text(&mut self, text: impl Into<String>) {
        self.frames.push((Opcode::Text, text.into().into_bytes()));
    }

    pub fn binary(&mut self, data: impl Into<Vec<u8>>) {
        self.frames.push((Opcode::Binary, data.into()));
    }

    /// Sends a normal close after the queued frames and ends the connection.
    pub fn close(&mut self) {
        self.close = true;
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && !self.close
    }

    fn encode(&self) -> BytesMut {
        let mut out = BytesMut::new();
        for (opcode, payload) in &self.frames {
            encode_frame(true, *opcode, payload, &mut out);
        }
        if self.close {
            encode_frame(true, Opcode::Close, &close_payload(1000, ""), &mut out);
        }
        out
    }
}

pub struct WsSession {
    parser: FrameParser,
    message: MessageBuffer,
    handler: WsHandler,
    path: String,
    query: Vec<(String, String)>,
}

impl WsSession {
    pub fn new(handler: WsHandler, path: String, query: Vec<(String, String)>, max_message_size: usize) -> Self {
        Self {
            parser: FrameParser::new(),
            message: MessageBuffer::new(max_message_size),
            handler,
            path,
            query,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn process(&mut self, data: &[u8], ctx: &SessionContext<'_>) -> (Outcome, usize) {
        let mut pos = 0;

        while pos < data.len() {
            match self.parser.run(&data[pos..], &mut self.message) {
                Ok(Progress::Continue) => return (Outcome::NeedMore, data.len()),
                Ok(Progress::Complete { consumed }) => {
                    pos += consumed;
                    if let Some(outcome) = self.on_frame(ctx) {
                        return (outcome, pos);
                    }
                }
                Err(err) => {
                    warn!(error = %err, path = %self.path, "websocket protocol violation");
                    let mut bytes = BytesMut::new();
                    encode_frame(true, Opcode::Close, &close_payload(CLOSE_PROTOCOL_ERROR, ""), &mut bytes);
                    return (Outcome::Respond(Reply::new(bytes, false)), data.len());
                }
            }
        }

        (Outcome::NeedMore, pos)
    }

    fn on_frame(&mut self, ctx: &SessionContext<'_>) -> Option<Outcome> {
        let frame = *self.parser.frame();

        let outcome = match frame.opcode {
            Opcode::Close => {
                let payload = self.parser.control_payload();
                let echoed = if payload.len() >= 2 { &payload[..2] } else { &[][..] };
                let mut bytes = BytesMut::new();
                encode_frame(true, Opcode::Close, echoed, &mut bytes);
                debug!(path = %self.path, "websocket closed by peer");
                Some(Outcome::Respond(Reply::new(bytes, false)))
            }
            Opcode::Ping => {
                let mut bytes = BytesMut::new();
                encode_frame(true, Opcode::Pong, self.parser.control_payload(), &mut bytes);
                Some(Outcome::Respond(Reply::new(bytes, true)))
            }
            Opcode::Pong => None,
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                if self.parser.is_message_end() {
                    let request = WsRequest {
                        opcode: self.parser.context().kind.unwrap_or(frame.opcode),
                        payload: self.message.take().freeze(),
                        path: self.path.clone(),
                        query: self.query.clone(),
                        connection: ctx.handle.clone(),
                    };
                    let handler = Arc::clone(&self.handler);
                    Some(Outcome::Dispatch(WorkItem::new(move || run_handler(handler, request))))
                } else {
                    None
                }
            }
        };

        self.parser.reset();
        outcome
    }
}

fn run_handler(handler: WsHandler, request: WsRequest) -> Reply {
    let mut response = WsResponse::default();
    let result = catch_unwind(AssertUnwindSafe(|| handler(&request, &mut response)));

    match result {
        Ok(()) => Reply::new(response.encode(), !response.close),
        Err(_) => {
            warn!(path = %request.path, "websocket handler panicked");
            let mut bytes = BytesMut::new();
            encode_frame(true, Opcode::Close, &close_payload(1011, ""), &mut bytes);
            Reply::new(bytes, false)
        }
    }
}
