//! Streaming gzip transforms used for request bodies and responses.
//!
//! Both sides write into an in-memory `Vec<u8>` and hand out whatever the
//! codec produced after each call, so callers never hold more than one
//! step's worth of output.

use std::io::Write;

use flate2::Compression;
use flate2::write::{GzEncoder, MultiGzDecoder};

use crate::error::ParseError;

/// Compressed bytes handed to the decoder per step. Each step's output is
/// passed to the sink before the next one runs, so a size limit enforced by
/// the sink cuts a decompression bomb off early.
const INFLATE_STEP: usize = 4096;

pub struct Inflater {
    decoder: MultiGzDecoder<Vec<u8>>,
}

impl Inflater {
    pub fn new() -> Self {
        Self {
            decoder: MultiGzDecoder::new(Vec::new()),
        }
    }

    /// Feeds compressed bytes and passes any inflated output to `sink`.
    pub fn inflate<F>(&mut self, input: &[u8], mut sink: F) -> Result<(), ParseError>
    where
        F: FnMut(&[u8]) -> Result<(), ParseError>,
    {
        let mut rest = input;
        while !rest.is_empty() {
            let step = &rest[..rest.len().min(INFLATE_STEP)];
            let written = self.decoder.write(step).map_err(|_| ParseError::BadRequest)?;
            if written == 0 {
                return Err(ParseError::BadRequest);
            }
            rest = &rest[written..];
            self.drain(&mut sink)?;
        }
        Ok(())
    }

    /// Flushes whatever the decoder still buffers once the input has ended.
    pub fn finish<F>(&mut self, mut sink: F) -> Result<(), ParseError>
    where
        F: FnMut(&[u8]) -> Result<(), ParseError>,
    {
        self.decoder.try_finish().map_err(|_| ParseError::BadRequest)?;
        self.drain(&mut sink)
    }

    pub fn reset(&mut self) {
        self.decoder = MultiGzDecoder::new(Vec::new());
    }

    fn drain<F>(&mut self, sink: &mut F) -> Result<(), ParseError>
    where
        F: FnMut(&[u8]) -> Result<(), ParseError>,
    {
        let produced = std::mem::take(self.decoder.get_mut());
        if produced.is_empty() {
            return Ok(());
        }
        sink(&produced)
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Deflater {
    encoder: GzEncoder<Vec<u8>>,
}

impl Deflater {
    pub fn new() -> Self {
        Self {
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
        }
    }

    /// Compresses `input`, returning the bytes the encoder emitted so far.
    pub fn deflate(&mut self, input: &[u8]) -> std::io::Result<Vec<u8>> {
        self.encoder.write_all(input)?;
        Ok(std::mem::take(self.encoder.get_mut()))
    }

    /// Ends the gzip member and returns the trailing bytes.
    pub fn finish(self) -> std::io::Result<Vec<u8>> {
        self.encoder.finish()
    }
}

impl Default for Deflater {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot gzip of a complete body.
pub fn compress(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut deflater = Deflater::new();
    let mut out = deflater.deflate(body)?;
    out.extend(deflater.finish()?);
    Ok(out)
}
