use std::sync::Arc;

use bytes::BytesMut;
use polyserve::domain::HostTable;
use polyserve::error::{ParseError, Progress};
use polyserve::http::parser::ParseLimits;
use polyserve::protocol::{Outcome, Reply, SessionContext};
use polyserve::websocket::frame::{Opcode, encode_frame, encode_masked_frame};
use polyserve::websocket::handshake::{accept_key, is_upgrade_request, upgrade_response};
use polyserve::websocket::parser::{FrameParser, MessageBuffer, WsStage};
use polyserve::websocket::{WsSession, ws_handler};
use polyserve::http::request::{Method, RequestBuilder};
use proptest::prelude::*;

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

/// Splits one unmasked server frame off `bytes`: (fin, opcode, payload, rest).
fn server_frame(bytes: &[u8]) -> (bool, u8, Vec<u8>, &[u8]) {
    let fin = bytes[0] & 0x80 != 0;
    let opcode = bytes[0] & 0x0f;
    assert_eq!(bytes[1] & 0x80, 0, "server frames are never masked");

    let (len, start) = match bytes[1] & 0x7f {
        126 => (u16::from_be_bytes([bytes[2], bytes[3]]) as usize, 4),
        127 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[2..10]);
            (u64::from_be_bytes(raw) as usize, 10)
        }
        n => (n as usize, 2),
    };

    (fin, opcode, bytes[start..start + len].to_vec(), &bytes[start + len..])
}

fn session() -> WsSession {
    let handler = ws_handler(|req, res| {
        if req.text() == Some("boom") {
            panic!("handler failure");
        }
        if req.text() == Some("bye") {
            res.close();
            return;
        }
        let prefix = req.query("prefix").unwrap_or("").to_string();
        match req.text() {
            Some(text) => res.text(format!("{}{}", prefix, text)),
            None => res.binary(req.payload.to_vec()),
        }
    });
    WsSession::new(
        handler,
        "/chat".to_string(),
        vec![("prefix".to_string(), ">".to_string())],
        1 << 20,
    )
}

fn respond(outcome: Outcome) -> Reply {
    match outcome {
        Outcome::Respond(reply) => reply,
        Outcome::Dispatch(work) => work.run(),
        Outcome::NeedMore => panic!("unexpected NeedMore"),
        Outcome::Close => panic!("unexpected Close"),
    }
}

#[test]
fn test_frame_round_trip_payload_lengths() {
    for len in [0usize, 1, 125, 126, 65535, 65536] {
        let payload: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        let mut raw = BytesMut::new();
        encode_masked_frame(true, Opcode::Binary, &payload, MASK, &mut raw);

        let mut parser = FrameParser::new();
        let mut message = MessageBuffer::new(1 << 20);
        let progress = parser.run(&raw, &mut message).unwrap();

        assert_eq!(progress, Progress::Complete { consumed: raw.len() }, "len {}", len);
        assert_eq!(parser.frame().payload_length, len as u64);
        assert_eq!(message.data(), &payload[..], "len {}", len);
        assert!(parser.is_message_end());
    }
}

const OPCODES: [Opcode; 5] = [Opcode::Text, Opcode::Binary, Opcode::Close, Opcode::Ping, Opcode::Pong];

/// Opcode, fin flag and a payload sized for the opcode: control frames stay
/// within 125 bytes, data frames cross the 126 and 65536 length encodings.
fn frame_case() -> impl Strategy<Value = (Opcode, bool, Vec<u8>)> {
    (0..OPCODES.len(), any::<bool>()).prop_flat_map(|(index, fin)| {
        let opcode = OPCODES[index];
        let len = if opcode.is_control() {
            (0usize..=125).boxed()
        } else {
            prop_oneof![0usize..300, 65530usize..65540].boxed()
        };
        (
            Just(opcode),
            Just(fin),
            len.prop_flat_map(|n| proptest::collection::vec(any::<u8>(), n)),
        )
    })
}

proptest! {
    #[test]
    fn test_frame_round_trip_opcode_fin_length(
        (opcode, fin, payload) in frame_case(),
        mask in any::<[u8; 4]>(),
        cut in any::<prop::sample::Index>(),
    ) {
        let mut raw = BytesMut::new();
        encode_masked_frame(fin, opcode, &payload, mask, &mut raw);

        let mut parser = FrameParser::new();
        let mut message = MessageBuffer::new(1 << 20);

        // Fragmented control frames are a protocol violation.
        if opcode.is_control() && !fin {
            prop_assert_eq!(parser.run(&raw, &mut message), Err(ParseError::BadRequest));
            return Ok(());
        }

        let cut = cut.index(raw.len());
        prop_assert_eq!(parser.run(&raw[..cut], &mut message), Ok(Progress::Continue));
        prop_assert_eq!(
            parser.run(&raw[cut..], &mut message),
            Ok(Progress::Complete { consumed: raw.len() - cut })
        );

        let frame = parser.frame();
        prop_assert_eq!(frame.opcode, opcode);
        prop_assert_eq!(frame.fin, fin);
        prop_assert_eq!(frame.payload_length, payload.len() as u64);

        if opcode.is_control() {
            prop_assert_eq!(parser.control_payload(), &payload[..]);
            prop_assert!(message.data().is_empty());
            prop_assert!(!parser.is_message_end());
        } else {
            prop_assert_eq!(message.data(), &payload[..]);
            prop_assert_eq!(parser.is_message_end(), fin);
            prop_assert_eq!(parser.context().kind, Some(opcode));
            prop_assert_eq!(parser.context().fragmented, !fin);
        }
    }
}

#[test]
fn test_frame_parser_byte_at_a_time() {
    let mut raw = BytesMut::new();
    encode_masked_frame(true, Opcode::Text, b"split me", MASK, &mut raw);

    let mut parser = FrameParser::new();
    let mut message = MessageBuffer::new(64);
    for (i, byte) in raw.iter().enumerate() {
        let progress = parser.run(std::slice::from_ref(byte), &mut message).unwrap();
        if i + 1 < raw.len() {
            assert_eq!(progress, Progress::Continue);
        } else {
            assert_eq!(progress, Progress::Complete { consumed: 1 });
        }
    }
    assert_eq!(message.data(), b"split me");
}

#[test]
fn test_frame_parser_rejects_unmasked() {
    let mut raw = BytesMut::new();
    encode_frame(true, Opcode::Text, b"hi", &mut raw);

    let mut parser = FrameParser::new();
    let mut message = MessageBuffer::new(64);
    assert_eq!(parser.run(&raw, &mut message), Err(ParseError::BadRequest));
}

#[test]
fn test_frame_parser_rejects_reserved_bits_and_opcodes() {
    let mut parser = FrameParser::new();
    let mut message = MessageBuffer::new(64);
    assert_eq!(parser.run(&[0xC1, 0x80], &mut message), Err(ParseError::BadRequest));

    let mut parser = FrameParser::new();
    assert_eq!(parser.run(&[0x83, 0x80], &mut message), Err(ParseError::BadRequest));
}

#[test]
fn test_frame_parser_rejects_bad_control_frames() {
    // Fragmented ping.
    let mut raw = BytesMut::new();
    encode_masked_frame(false, Opcode::Ping, b"x", MASK, &mut raw);
    let mut parser = FrameParser::new();
    let mut message = MessageBuffer::new(64);
    assert_eq!(parser.run(&raw, &mut message), Err(ParseError::BadRequest));

    // Ping with an extended length.
    let mut parser = FrameParser::new();
    assert_eq!(
        parser.run(&[0x89, 0x80 | 126, 0x00, 0x7e], &mut message),
        Err(ParseError::BadRequest)
    );
}

#[test]
fn test_frame_parser_rejects_interleaved_data_frames() {
    let mut raw = BytesMut::new();
    encode_masked_frame(false, Opcode::Text, b"a", MASK, &mut raw);
    let first = raw.len();
    encode_masked_frame(true, Opcode::Text, b"b", MASK, &mut raw);

    let mut parser = FrameParser::new();
    let mut message = MessageBuffer::new(64);
    parser.run(&raw[..first], &mut message).unwrap();
    parser.reset();
    assert_eq!(parser.run(&raw[first..], &mut message), Err(ParseError::BadRequest));
}

#[test]
fn test_frame_parser_control_between_fragments() {
    let mut raw = BytesMut::new();
    encode_masked_frame(false, Opcode::Text, b"hel", MASK, &mut raw);
    let a = raw.len();
    encode_masked_frame(true, Opcode::Ping, b"p", MASK, &mut raw);
    let b = raw.len();
    encode_masked_frame(true, Opcode::Continuation, b"lo", MASK, &mut raw);

    let mut parser = FrameParser::new();
    let mut message = MessageBuffer::new(64);

    parser.run(&raw[..a], &mut message).unwrap();
    parser.reset();
    parser.run(&raw[a..b], &mut message).unwrap();
    assert_eq!(parser.control_payload(), b"p");
    assert!(!parser.is_message_end());
    parser.reset();
    assert_eq!(parser.context().kind, Some(Opcode::Text));

    parser.run(&raw[b..], &mut message).unwrap();
    assert!(parser.is_message_end());
    assert_eq!(message.data(), b"hello");
}

#[test]
fn test_message_buffer_limit() {
    let mut raw = BytesMut::new();
    encode_masked_frame(true, Opcode::Binary, &[0u8; 32], MASK, &mut raw);

    let mut parser = FrameParser::new();
    let mut message = MessageBuffer::new(16);
    assert_eq!(parser.run(&raw, &mut message), Err(ParseError::PayloadTooLarge));
    assert_eq!(parser.stage(), WsStage::Payload);
}

#[test]
fn test_handshake_accept() {
    let request = RequestBuilder::new()
        .method(Method::GET)
        .uri("/chat")
        .header("Host", "example.com")
        .header("Upgrade", "websocket")
        .header("Connection", "keep-alive, Upgrade")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
        .build()
        .unwrap();

    assert!(is_upgrade_request(&request));
    let response = upgrade_response(&request).unwrap();
    assert_eq!(response.status.as_u16(), 101);
    assert_eq!(
        response.header("Sec-WebSocket-Accept"),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );
    assert_eq!(accept_key(" dGhlIHNhbXBsZSBub25jZQ== "), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
}

#[test]
fn test_handshake_requires_version_13() {
    let request = RequestBuilder::new()
        .method(Method::GET)
        .uri("/chat")
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Version", "8")
        .header("Sec-WebSocket-Key", "abc")
        .build()
        .unwrap();
    assert!(!is_upgrade_request(&request));
}

#[test]
fn test_session_echoes_text_through_handler() {
    let hosts = Arc::new(HostTable::new());
    let ctx = SessionContext {
        hosts: &hosts,
        limits: ParseLimits::default(),
        handle: None,
    };
    let mut session = session();

    let mut raw = BytesMut::new();
    encode_masked_frame(true, Opcode::Text, b"hello", MASK, &mut raw);

    let (outcome, consumed) = session.process(&raw, &ctx);
    assert_eq!(consumed, raw.len());
    assert!(matches!(outcome, Outcome::Dispatch(_)));

    let reply = respond(outcome);
    assert!(reply.keep_alive);
    let (fin, opcode, payload, rest) = server_frame(&reply.bytes);
    assert!(fin);
    assert_eq!(opcode, 0x1);
    assert_eq!(payload, b">hello");
    assert!(rest.is_empty());
}

#[test]
fn test_session_answers_ping_and_ignores_pong() {
    let hosts = Arc::new(HostTable::new());
    let ctx = SessionContext {
        hosts: &hosts,
        limits: ParseLimits::default(),
        handle: None,
    };
    let mut session = session();

    let mut raw = BytesMut::new();
    encode_masked_frame(true, Opcode::Pong, b"late", MASK, &mut raw);
    encode_masked_frame(true, Opcode::Ping, b"are you there", MASK, &mut raw);

    let (outcome, consumed) = session.process(&raw, &ctx);
    assert_eq!(consumed, raw.len());

    let reply = respond(outcome);
    let (_, opcode, payload, _) = server_frame(&reply.bytes);
    assert_eq!(opcode, 0xA);
    assert_eq!(payload, b"are you there");
}

#[test]
fn test_session_stops_at_first_reply() {
    let hosts = Arc::new(HostTable::new());
    let ctx = SessionContext {
        hosts: &hosts,
        limits: ParseLimits::default(),
        handle: None,
    };
    let mut session = session();

    let mut raw = BytesMut::new();
    encode_masked_frame(true, Opcode::Text, b"one", MASK, &mut raw);
    let first = raw.len();
    encode_masked_frame(true, Opcode::Text, b"two", MASK, &mut raw);

    let (outcome, consumed) = session.process(&raw, &ctx);
    assert_eq!(consumed, first);
    assert_eq!(server_frame(&respond(outcome).bytes).2, b">one");

    let (outcome, consumed) = session.process(&raw[first..], &ctx);
    assert_eq!(consumed, raw.len() - first);
    assert_eq!(server_frame(&respond(outcome).bytes).2, b">two");
}

#[test]
fn test_session_close_is_echoed() {
    let hosts = Arc::new(HostTable::new());
    let ctx = SessionContext {
        hosts: &hosts,
        limits: ParseLimits::default(),
        handle: None,
    };
    let mut session = session();

    let mut raw = BytesMut::new();
    encode_masked_frame(true, Opcode::Close, &[0x03, 0xe8, b'o', b'k'], MASK, &mut raw);

    let reply = respond(session.process(&raw, &ctx).0);
    assert!(!reply.keep_alive);
    let (_, opcode, payload, _) = server_frame(&reply.bytes);
    assert_eq!(opcode, 0x8);
    assert_eq!(payload, [0x03, 0xe8]);
}

#[test]
fn test_session_protocol_error_closes_with_1002() {
    let hosts = Arc::new(HostTable::new());
    let ctx = SessionContext {
        hosts: &hosts,
        limits: ParseLimits::default(),
        handle: None,
    };
    let mut session = session();

    let mut raw = BytesMut::new();
    encode_frame(true, Opcode::Text, b"unmasked", &mut raw);

    let reply = respond(session.process(&raw, &ctx).0);
    assert!(!reply.keep_alive);
    let (_, opcode, payload, _) = server_frame(&reply.bytes);
    assert_eq!(opcode, 0x8);
    assert_eq!(payload, 1002u16.to_be_bytes());
}

#[test]
fn test_session_handler_close_and_panic() {
    let hosts = Arc::new(HostTable::new());
    let ctx = SessionContext {
        hosts: &hosts,
        limits: ParseLimits::default(),
        handle: None,
    };

    let mut raw = BytesMut::new();
    encode_masked_frame(true, Opcode::Text, b"bye", MASK, &mut raw);
    let reply = respond(session().process(&raw, &ctx).0);
    assert!(!reply.keep_alive);
    let (_, opcode, payload, _) = server_frame(&reply.bytes);
    assert_eq!(opcode, 0x8);
    assert_eq!(payload, 1000u16.to_be_bytes());

    let mut raw = BytesMut::new();
    encode_masked_frame(true, Opcode::Text, b"boom", MASK, &mut raw);
    let reply = respond(session().process(&raw, &ctx).0);
    assert!(!reply.keep_alive);
    assert_eq!(server_frame(&reply.bytes).2, 1011u16.to_be_bytes());
}
