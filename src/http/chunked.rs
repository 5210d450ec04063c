//! Chunked transfer-coding.
//!
//! [`ChunkedDecoder`] turns `<hex-size>\r\n<bytes>\r\n ... 0\r\n` into the
//! raw body, resuming at any byte boundary. The encoder half frames
//! response bodies the same way.

use bytes::{BufMut, BytesMut};

use crate::buffer::ByteAccumulator;
use crate::error::{ParseError, Progress};

/// Longest accepted chunk-size line, in hex digits.
pub const MAX_CHUNK_SIZE_DIGITS: usize = 8;

/// Destination for decoded body bytes.
pub trait PayloadSink {
    fn append(&mut self, bytes: &[u8]) -> Result<(), ParseError>;
}

impl PayloadSink for BytesMut {
    fn append(&mut self, bytes: &[u8]) -> Result<(), ParseError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

impl PayloadSink for Vec<u8> {
    fn append(&mut self, bytes: &[u8]) -> Result<(), ParseError> {
        self.try_reserve(bytes.len())
            .map_err(|_| ParseError::OutOfMemory)?;
        self.extend_from_slice(bytes);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStage {
    Size,
    SizeNewline,
    Body,
    BodyNewline,
}

#[derive(Debug)]
pub struct ChunkedDecoder {
    stage: ChunkStage,
    size_buf: ByteAccumulator<16>,
    chunk_size: usize,
    chunk_read: usize,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            stage: ChunkStage::Size,
            size_buf: ByteAccumulator::new(),
            chunk_size: 0,
            chunk_read: 0,
        }
    }

    pub fn stage(&self) -> ChunkStage {
        self.stage
    }

    pub fn reset(&mut self) {
        self.stage = ChunkStage::Size;
        self.size_buf.reset();
        self.chunk_size = 0;
        self.chunk_read = 0;
    }

    /// Decodes as much of `data` as possible into `sink`.
    ///
    /// The zero-size chunk completes decoding as soon as its size line's
    /// `\r` is seen; `consumed` counts bytes up to and including it.
    pub fn run(&mut self, data: &[u8], sink: &mut dyn PayloadSink) -> Result<Progress, ParseError> {
        let mut pos = 0;

        while pos < data.len() {
            let ch = data[pos];

            match self.stage {
                ChunkStage::Size => {
                    if self.size_buf.written() > MAX_CHUNK_SIZE_DIGITS {
                        return Err(ParseError::BadRequest);
                    }
                    if ch == b'\r' {
                        self.size_buf.complete()?;
                        self.chunk_size = hex_to_size(self.size_buf.get())?;
                        self.chunk_read = 0;
                        self.size_buf.reset();

                        if self.chunk_size == 0 {
                            return Ok(Progress::Complete { consumed: pos + 1 });
                        }
                        self.stage = ChunkStage::SizeNewline;
                    } else {
                        self.size_buf.push(ch)?;
                    }
                    pos += 1;
                }
                ChunkStage::SizeNewline => {
                    if ch != b'\n' {
                        return Err(ParseError::BadRequest);
                    }
                    self.stage = ChunkStage::Body;
                    pos += 1;
                }
                ChunkStage::Body => {
                    if self.chunk_read == self.chunk_size {
                        if ch != b'\r' {
                            return Err(ParseError::BadRequest);
                        }
                        self.stage = ChunkStage::BodyNewline;
                        pos += 1;
                        continue;
                    }

                    let wanted = self.chunk_size - self.chunk_read;
                    let take = wanted.min(data.len() - pos);
                    sink.append(&data[pos..pos + take])?;
                    self.chunk_read += take;
                    pos += take;
                }
                ChunkStage::BodyNewline => {
                    if ch != b'\n' {
                        return Err(ParseError::BadRequest);
                    }
                    self.stage = ChunkStage::Size;
                    pos += 1;
                }
            }
        }

        Ok(Progress::Continue)
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

const HEX_TABLE: [i8; 256] = {
    let mut table = [-1i8; 256];
    let mut i = 0;
    while i < 10 {
        table[b'0' as usize + i] = i as i8;
        i += 1;
    }
    let mut i = 0;
    while i < 6 {
        table[b'a' as usize + i] = 10 + i as i8;
        table[b'A' as usize + i] = 10 + i as i8;
        i += 1;
    }
    table
};

/// Converts a hex chunk size. Fails on an empty run, a non-hex byte or a
/// value above `i32::MAX`.
pub fn hex_to_size(digits: &[u8]) -> Result<usize, ParseError> {
    if digits.is_empty() {
        return Err(ParseError::BadRequest);
    }

    let mut value: i64 = 0;
    for &digit in digits {
        let nibble = HEX_TABLE[digit as usize];
        if nibble < 0 {
            return Err(ParseError::BadRequest);
        }
        value = (value << 4) | nibble as i64;
        if value > i32::MAX as i64 {
            return Err(ParseError::BadRequest);
        }
    }

    Ok(value as usize)
}

/// Appends one chunk frame for `data`. Empty input writes nothing, since an
/// empty chunk would terminate the body.
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

pub fn encode_last_chunk(out: &mut BytesMut) {
    out.put_slice(b"0\r\n\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_limits() {
        assert_eq!(hex_to_size(b"7fffffff"), Ok(i32::MAX as usize));
        assert_eq!(hex_to_size(b"80000000"), Err(ParseError::BadRequest));
        assert_eq!(hex_to_size(b"1G"), Err(ParseError::BadRequest));
        assert_eq!(hex_to_size(b"Ff"), Ok(255));
    }

    #[test]
    fn crlf_split_across_reads() {
        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();

        assert_eq!(decoder.run(b"3\r\nabc", &mut body), Ok(Progress::Continue));
        assert_eq!(decoder.stage(), ChunkStage::Body);
        assert_eq!(decoder.run(b"\r", &mut body), Ok(Progress::Continue));
        assert_eq!(decoder.run(b"\n0\r\n\r\n", &mut body), Ok(Progress::Complete { consumed: 3 }));
        assert_eq!(body, b"abc");
    }

    #[test]
    fn missing_crlf_after_chunk() {
        let mut decoder = ChunkedDecoder::new();
        let mut body = Vec::new();
        assert_eq!(decoder.run(b"1\r\nab", &mut body), Err(ParseError::BadRequest));
    }
}
