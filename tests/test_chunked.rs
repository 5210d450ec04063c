use bytes::BytesMut;
use polyserve::error::{ParseError, Progress};
use polyserve::http::chunked::{ChunkedDecoder, encode_chunk, encode_last_chunk, hex_to_size};
use proptest::prelude::*;

fn encode(chunks: &[Vec<u8>]) -> BytesMut {
    let mut out = BytesMut::new();
    for chunk in chunks {
        encode_chunk(chunk, &mut out);
    }
    encode_last_chunk(&mut out);
    out
}

fn decode_in_steps(wire: &[u8], step: usize) -> Result<(Vec<u8>, usize), ParseError> {
    let mut decoder = ChunkedDecoder::new();
    let mut body = Vec::new();
    let mut offset = 0;

    for piece in wire.chunks(step.max(1)) {
        match decoder.run(piece, &mut body)? {
            Progress::Continue => offset += piece.len(),
            Progress::Complete { consumed } => return Ok((body, offset + consumed)),
        }
    }

    panic!("terminal chunk never seen");
}

#[test]
fn test_chunked_empty_body() {
    let (body, consumed) = decode_in_steps(b"0\r\n\r\n", 64).unwrap();
    assert!(body.is_empty());
    assert_eq!(consumed, 2);
}

#[test]
fn test_chunked_hex_sizes_any_case() {
    let wire = b"a\r\n0123456789\r\nA\r\nabcdefghij\r\n0\r\n\r\n";
    let (body, _) = decode_in_steps(wire, 5).unwrap();
    assert_eq!(body, b"0123456789abcdefghij");
}

#[test]
fn test_chunked_missing_crlf_after_data() {
    let mut decoder = ChunkedDecoder::new();
    let mut body = Vec::new();
    assert_eq!(
        decoder.run(b"3\r\nabcX\r\n0\r\n\r\n", &mut body),
        Err(ParseError::BadRequest)
    );
}

#[test]
fn test_chunked_bad_size_line() {
    let mut decoder = ChunkedDecoder::new();
    let mut body = Vec::new();
    assert_eq!(decoder.run(b"zz\r\n", &mut body), Err(ParseError::BadRequest));

    let mut decoder = ChunkedDecoder::new();
    assert_eq!(decoder.run(b"\r\n", &mut body), Err(ParseError::BadRequest));

    let mut decoder = ChunkedDecoder::new();
    assert_eq!(decoder.run(b"3\rabc", &mut body), Err(ParseError::BadRequest));
}

#[test]
fn test_chunked_size_overflow() {
    assert_eq!(hex_to_size(b"80000000"), Err(ParseError::BadRequest));
    assert_eq!(hex_to_size(b"ffffffffff"), Err(ParseError::BadRequest));

    let mut decoder = ChunkedDecoder::new();
    let mut body = Vec::new();
    assert_eq!(
        decoder.run(b"123456789abc\r\n", &mut body),
        Err(ParseError::BadRequest)
    );
}

#[test]
fn test_chunked_encode_skips_empty_chunk() {
    let wire = encode(&[b"ab".to_vec(), Vec::new(), b"c".to_vec()]);
    assert_eq!(&wire[..], b"2\r\nab\r\n1\r\nc\r\n0\r\n\r\n");
}

#[test]
fn test_chunked_large_body() {
    let big: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();
    let wire = encode(&[big.clone()]);
    assert!(wire.starts_with(b"11170\r\n"));

    let (body, _) = decode_in_steps(&wire, 4096).unwrap();
    assert_eq!(body, big);
}

proptest! {
    #[test]
    fn test_chunked_decodes_any_split(
        chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 0..8),
        step in 1usize..64,
    ) {
        let wire = encode(&chunks);
        let (body, consumed) = decode_in_steps(&wire, step).unwrap();

        prop_assert_eq!(body, chunks.concat());
        // Everything up to the terminal chunk's CR.
        prop_assert_eq!(consumed, wire.len() - 3);
    }
}
