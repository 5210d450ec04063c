//! HTTP/1.x protocol role.
//!
//! Parses requests off the connection and decides what happens to each
//! one: canned error, redirect, WebSocket upgrade, or a route handler queued
//! on the connection's work queue.

use std::panic::{AssertUnwindSafe, catch_unwind};

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::connection::queue::WorkItem;
use crate::error::{ParseError, Progress};
use crate::http::parser::{ParseLimits, RequestParser};
use crate::http::redirect::{self, RedirectOutcome};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::route::{HttpHandler, RouteMatch};
use crate::http::writer::serialize_response;
use crate::protocol::{Outcome, Protocol, Reply, SessionContext};
use crate::websocket::handshake;
use crate::websocket::session::{WsHandler, WsSession};

const FALLBACK_500: &[u8] =
    b"HTTP/1.1 500 Internal Server Error\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

pub struct Http1Session {
    parser: RequestParser,
}

impl Http1Session {
    pub fn new(limits: ParseLimits) -> Self {
        Self {
            parser: RequestParser::new(limits),
        }
    }

    pub fn reset(&mut self) {
        self.parser.reset();
    }

    pub fn process(&mut self, data: &[u8], ctx: &SessionContext<'_>) -> (Outcome, usize) {
        match self.parser.run(data, &**ctx.hosts) {
            Ok(Progress::Continue) => (Outcome::NeedMore, data.len()),
            Ok(Progress::Complete { consumed }) => {
                let vhost = self.parser.vhost();
                let request = self.parser.take_request();
                (self.dispatch(request, vhost, ctx), consumed)
            }
            Err(err) => {
                warn!(error = %err, stage = ?self.parser.stage(), "failed to parse request");
                self.parser.reset();
                (Outcome::Respond(encode(&Response::from_error(err), false, false)), data.len())
            }
        }
    }

    fn dispatch(&mut self, mut request: Request, vhost: Option<usize>, ctx: &SessionContext<'_>) -> Outcome {
        let Some(host) = vhost.and_then(|index| ctx.hosts.get(index)) else {
            return Outcome::Respond(encode(&Response::from_error(ParseError::HostNotFound), false, false));
        };

        let keep_alive = request.keep_alive();
        let head_only = request.method == Method::HEAD;

        match redirect::resolve(&host.redirects, &mut request) {
            Ok(RedirectOutcome::Resolved { hops }) => {
                if hops > 0 {
                    debug!(path = %request.path, hops, "request rewritten");
                }
            }
            Ok(RedirectOutcome::External(location)) => {
                return Outcome::Respond(encode(&Response::redirect(&location), false, head_only));
            }
            Err(err) => {
                return Outcome::Respond(encode(&Response::from_error(err), keep_alive, head_only));
            }
        }

        if handshake::is_upgrade_request(&request) {
            let found = host.websockets.find(&request.path, Method::GET);
            return self.upgrade(request, found, ctx);
        }

        match host.routes.find(&request.path, request.method) {
            RouteMatch::Found { handler, params } => {
                request.query.extend(params);
                Outcome::Dispatch(WorkItem::new(move || {
                    run_handler(handler, request, keep_alive, head_only)
                }))
            }
            RouteMatch::MethodNotAllowed => Outcome::Respond(encode(
                &Response::status(StatusCode::MethodNotAllowed),
                keep_alive,
                head_only,
            )),
            RouteMatch::NotFound => {
                Outcome::Respond(encode(&Response::not_found(), keep_alive, head_only))
            }
        }
    }

    fn upgrade(&mut self, mut request: Request, found: RouteMatch<WsHandler>, ctx: &SessionContext<'_>) -> Outcome {
        let RouteMatch::Found { handler, params } = found else {
            return Outcome::Respond(encode(&Response::not_found(), false, false));
        };
        request.query.extend(params);

        let Some(response) = handshake::upgrade_response(&request) else {
            return Outcome::Respond(encode(&Response::from_error(ParseError::BadRequest), false, false));
        };

        debug!(path = %request.path, "upgrading to websocket");

        let session = WsSession::new(handler, request.path, request.query, ctx.limits.max_body_size);
        let mut reply = encode(&response, true, false);
        reply.switch_to = Some(Protocol::WebSocket(session));
        Outcome::Respond(reply)
    }
}

fn run_handler(handler: HttpHandler, request: Request, keep_alive: bool, head_only: bool) -> Reply {
    let mut response = Response::new(StatusCode::Ok);
    let result = catch_unwind(AssertUnwindSafe(|| handler(&request, &mut response)));

    match result {
        Ok(()) => encode(&response, keep_alive, head_only),
        Err(_) => {
            warn!(path = %request.path, "handler panicked");
            encode(&Response::internal_error(), false, head_only)
        }
    }
}

/// Serializes `response` into a reply, falling back to a bare 500.
pub fn encode(response: &Response, keep_alive: bool, head_only: bool) -> Reply {
    match serialize_response(response, keep_alive, head_only) {
        Ok(bytes) => Reply::new(bytes, keep_alive),
        Err(e) => {
            warn!(error = %e, "failed to serialize response");
            Reply::new(BytesMut::from(FALLBACK_500), false)
        }
    }
}
