use std::sync::Arc;

use polyserve::domain::{HostTable, VirtualHost};
use polyserve::http::connection::Http1Session;
use polyserve::http::parser::ParseLimits;
use polyserve::http::redirect::RedirectRule;
use polyserve::http::request::Method;
use polyserve::http::route::handler;
use polyserve::protocol::{Outcome, ProtocolKind, Reply, SessionContext};
use polyserve::websocket::ws_handler;

fn hosts() -> Arc<HostTable> {
    let mut host = VirtualHost::new("site");
    host.add_domain("example.com").unwrap();
    host.add_route(
        r"/greet/{name|\w+}",
        Method::GET,
        handler(|req, res| {
            res.set_header("Content-Type", "text/plain");
            res.write(format!("hello {}", req.query("name").unwrap_or("")));
        }),
    )
    .unwrap();
    host.add_route("/submit", Method::POST, handler(|req, res| res.write(&req.body[..])))
        .unwrap();
    host.add_route("/panic", Method::GET, handler(|_, _| panic!("handler bug")))
        .unwrap();
    host.add_websocket("/ws", ws_handler(|_, _| {})).unwrap();
    host.add_redirect(RedirectRule::new("^/old$", "/greet/old").unwrap());
    host.add_redirect(RedirectRule::new("^/away$", "https://example.org/").unwrap());
    host.add_redirect(RedirectRule::new("^/spin$", "/spin").unwrap());

    let mut table = HostTable::new();
    table.add(host);
    Arc::new(table)
}

fn run(session: &mut Http1Session, hosts: &Arc<HostTable>, input: &[u8]) -> (Reply, usize) {
    let ctx = SessionContext {
        hosts,
        limits: ParseLimits::default(),
        handle: None,
    };
    let (outcome, consumed) = session.process(input, &ctx);
    let reply = match outcome {
        Outcome::Respond(reply) => reply,
        Outcome::Dispatch(work) => work.run(),
        Outcome::NeedMore => panic!("request incomplete"),
        Outcome::Close => panic!("unexpected close"),
    };
    (reply, consumed)
}

fn text(reply: &Reply) -> String {
    String::from_utf8(reply.bytes.to_vec()).unwrap()
}

#[test]
fn test_session_dispatches_route_with_params() {
    let hosts = hosts();
    let mut session = Http1Session::new(ParseLimits::default());
    let req = b"GET /greet/ann HTTP/1.1\r\nHost: example.com\r\n\r\n";

    let (reply, consumed) = run(&mut session, &hosts, req);
    assert_eq!(consumed, req.len());
    assert!(reply.keep_alive);
    assert!(reply.switch_to.is_none());

    let out = text(&reply);
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(out.ends_with("\r\n\r\nhello ann"));
}

#[test]
fn test_session_head_has_no_body() {
    let hosts = hosts();
    let mut session = Http1Session::new(ParseLimits::default());
    // HEAD is routed like any other method, so it needs its own handler.
    let (reply, _) = run(
        &mut session,
        &hosts,
        b"HEAD /greet/ann HTTP/1.1\r\nHost: example.com\r\n\r\n",
    );
    let out = text(&reply);
    assert!(out.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
    assert!(out.ends_with("\r\n\r\n"));
}

#[test]
fn test_session_post_body_echo() {
    let hosts = hosts();
    let mut session = Http1Session::new(ParseLimits::default());
    let (reply, _) = run(
        &mut session,
        &hosts,
        b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nping",
    );
    assert!(text(&reply).ends_with("Content-Length: 4\r\n\r\nping"));
}

#[test]
fn test_session_not_found_and_method_not_allowed() {
    let hosts = hosts();
    let mut session = Http1Session::new(ParseLimits::default());

    let (reply, _) = run(&mut session, &hosts, b"GET /missing HTTP/1.1\r\nHost: example.com\r\n\r\n");
    assert!(text(&reply).starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(reply.keep_alive);

    let (reply, _) = run(&mut session, &hosts, b"GET /submit HTTP/1.1\r\nHost: example.com\r\n\r\n");
    assert!(text(&reply).starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
}

#[test]
fn test_session_unknown_host() {
    let hosts = hosts();
    let mut session = Http1Session::new(ParseLimits::default());
    let (reply, _) = run(&mut session, &hosts, b"GET / HTTP/1.1\r\nHost: other.org\r\n\r\n");

    assert!(text(&reply).starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(!reply.keep_alive);
}

#[test]
fn test_session_parse_error_closes() {
    let hosts = hosts();
    let mut session = Http1Session::new(ParseLimits::default());
    let input = b"BREW /pot HTTP/1.1\r\n";
    let (reply, consumed) = run(&mut session, &hosts, input);

    assert_eq!(consumed, input.len());
    assert!(text(&reply).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(!reply.keep_alive);
}

#[test]
fn test_session_payload_too_large() {
    let hosts = hosts();
    let mut session = Http1Session::new(ParseLimits::default());
    let (reply, _) = run(
        &mut session,
        &hosts,
        b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 999999999\r\n\r\n",
    );
    assert!(text(&reply).starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
}

#[test]
fn test_session_internal_redirect() {
    let hosts = hosts();
    let mut session = Http1Session::new(ParseLimits::default());
    let (reply, _) = run(&mut session, &hosts, b"GET /old HTTP/1.1\r\nHost: example.com\r\n\r\n");
    assert!(text(&reply).ends_with("hello old"));
}

#[test]
fn test_session_external_redirect_and_loop() {
    let hosts = hosts();
    let mut session = Http1Session::new(ParseLimits::default());

    let (reply, _) = run(&mut session, &hosts, b"GET /away HTTP/1.1\r\nHost: example.com\r\n\r\n");
    let out = text(&reply);
    assert!(out.starts_with("HTTP/1.1 301 Moved Permanently\r\n"));
    assert!(out.contains("Location: https://example.org/\r\n"));
    assert!(!reply.keep_alive);

    let (reply, _) = run(&mut session, &hosts, b"GET /spin HTTP/1.1\r\nHost: example.com\r\n\r\n");
    assert!(text(&reply).starts_with("HTTP/1.1 508 Loop Detected\r\n"));
}

#[test]
fn test_session_handler_panic_is_500() {
    let hosts = hosts();
    let mut session = Http1Session::new(ParseLimits::default());
    let (reply, _) = run(&mut session, &hosts, b"GET /panic HTTP/1.1\r\nHost: example.com\r\n\r\n");

    assert!(text(&reply).starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    assert!(!reply.keep_alive);
}

#[test]
fn test_session_upgrade_switches_to_websocket() {
    let hosts = hosts();
    let mut session = Http1Session::new(ParseLimits::default());
    let req = b"GET /ws HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

    let (reply, _) = run(&mut session, &hosts, req);
    let out = text(&reply);
    assert!(out.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(out.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
    assert!(reply.keep_alive);

    let next = reply.switch_to.expect("protocol switch");
    assert_eq!(next.kind(), ProtocolKind::WebSocket);
}

#[test]
fn test_session_upgrade_to_unknown_path_is_404() {
    let hosts = hosts();
    let mut session = Http1Session::new(ParseLimits::default());
    let req = b"GET /nope HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: abc\r\n\r\n";

    let (reply, _) = run(&mut session, &hosts, req);
    assert!(text(&reply).starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(reply.switch_to.is_none());
}
