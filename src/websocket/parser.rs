//! Incremental RFC 6455 frame parser.
//!
//! ```text
//! FirstByte -> SecondByte -> [PayloadLen126 | PayloadLen127] -> MaskKey
//!                                                                 |
//!                              ControlPayload <- control ---------+
//!                              Payload        <- data ------------+
//! ```
//!
//! Control payloads are at most 125 bytes and are unmasked here into the
//! parser's own buffer. Data payloads are streamed to a [`FrameSink`] still
//! masked, together with the mask and their offset in the frame, so large
//! messages never have to be buffered by the parser.

use bytes::BytesMut;

use crate::buffer::ByteAccumulator;
use crate::error::{ParseError, Progress};
use crate::websocket::frame::{Frame, MAX_CONTROL_PAYLOAD, Opcode, apply_mask};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsStage {
    FirstByte,
    SecondByte,
    PayloadLen126,
    PayloadLen127,
    MaskKey,
    ControlPayload,
    Payload,
    Complete,
}

/// Receiver for data-frame payload bytes.
pub trait FrameSink {
    /// `masked` is a run of payload bytes starting at `offset` within the
    /// current frame, exactly as received.
    fn payload(&mut self, frame: &Frame, offset: u64, masked: &[u8]) -> Result<(), ParseError>;
}

/// Sink that unmasks data frames and assembles them into one message.
#[derive(Debug)]
pub struct MessageBuffer {
    data: BytesMut,
    limit: usize,
}

impl MessageBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: BytesMut::new(),
            limit,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn take(&mut self) -> BytesMut {
        self.data.split()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl FrameSink for MessageBuffer {
    fn payload(&mut self, frame: &Frame, offset: u64, masked: &[u8]) -> Result<(), ParseError> {
        if self.data.len() + masked.len() > self.limit {
            return Err(ParseError::PayloadTooLarge);
        }
        let start = self.data.len();
        self.data.extend_from_slice(masked);
        apply_mask(frame.mask, offset, &mut self.data[start..]);
        Ok(())
    }
}

/// State of the message a sequence of frames belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    /// Opcode of the frame that opened the current message.
    pub kind: Option<Opcode>,
    /// A frame with fin=0 has been seen for the current message.
    pub fragmented: bool,
    resettable: bool,
}

impl MessageContext {
    pub fn is_resettable(&self) -> bool {
        self.resettable
    }
}

impl Default for MessageContext {
    fn default() -> Self {
        Self {
            kind: None,
            fragmented: false,
            resettable: true,
        }
    }
}

pub struct FrameParser {
    stage: WsStage,
    frame: Frame,
    buf: ByteAccumulator<8>,
    control: ByteAccumulator<128>,
    received: u64,
    context: MessageContext,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            stage: WsStage::FirstByte,
            frame: Frame::default(),
            buf: ByteAccumulator::new(),
            control: ByteAccumulator::new(),
            received: 0,
            context: MessageContext::default(),
        }
    }

    pub fn stage(&self) -> WsStage {
        self.stage
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn context(&self) -> &MessageContext {
        &self.context
    }

    /// Unmasked payload of the last control frame.
    pub fn control_payload(&self) -> &[u8] {
        self.control.get()
    }

    /// True when the completed frame ends a data message.
    pub fn is_message_end(&self) -> bool {
        self.frame.fin && !self.frame.opcode.is_control()
    }

    /// Prepares for the next frame. Message state survives unless the frame
    /// just parsed ended the message.
    pub fn reset(&mut self) {
        self.stage = WsStage::FirstByte;
        self.frame = Frame::default();
        self.buf.reset();
        self.control.reset();
        self.received = 0;
        if self.context.resettable {
            self.context = MessageContext::default();
        }
    }

    pub fn run(&mut self, data: &[u8], sink: &mut dyn FrameSink) -> Result<Progress, ParseError> {
        if self.stage == WsStage::Complete {
            return Ok(Progress::Complete { consumed: 0 });
        }

        let mut pos = 0;

        while pos < data.len() {
            if self.stage == WsStage::Payload {
                let remaining = self.frame.payload_length - self.received;
                let take = remaining.min((data.len() - pos) as u64) as usize;
                sink.payload(&self.frame, self.received, &data[pos..pos + take])?;
                self.received += take as u64;
                pos += take;

                if self.received == self.frame.payload_length {
                    self.stage = WsStage::Complete;
                    return Ok(Progress::Complete { consumed: pos });
                }
                continue;
            }

            let ch = data[pos];
            pos += 1;

            match self.stage {
                WsStage::FirstByte => {
                    self.parse_first_byte(ch)?;
                    self.stage = WsStage::SecondByte;
                }
                WsStage::SecondByte => {
                    self.frame.masked = ch & 0x80 != 0;
                    if !self.frame.masked {
                        return Err(ParseError::BadRequest);
                    }
                    self.stage = match ch & 0x7F {
                        126 => WsStage::PayloadLen126,
                        127 => WsStage::PayloadLen127,
                        len => {
                            self.frame.payload_length = len as u64;
                            WsStage::MaskKey
                        }
                    };
                }
                WsStage::PayloadLen126 | WsStage::PayloadLen127 => {
                    if self.frame.opcode.is_control() {
                        return Err(ParseError::BadRequest);
                    }
                    self.buf.push(ch)?;
                    let byte_count = if self.stage == WsStage::PayloadLen126 { 2 } else { 8 };
                    if self.buf.written() < byte_count {
                        continue;
                    }
                    self.set_payload_length(byte_count)?;
                    self.stage = WsStage::MaskKey;
                }
                WsStage::MaskKey => {
                    self.buf.push(ch)?;
                    if self.buf.written() < 4 {
                        continue;
                    }
                    self.buf.complete()?;
                    self.frame.mask.copy_from_slice(self.buf.get());
                    self.buf.reset();

                    if self.frame.payload_length == 0 {
                        self.stage = WsStage::Complete;
                        return Ok(Progress::Complete { consumed: pos });
                    }
                    self.stage = if self.frame.opcode.is_control() {
                        WsStage::ControlPayload
                    } else {
                        WsStage::Payload
                    };
                }
                WsStage::ControlPayload => {
                    let byte = ch ^ self.frame.mask[(self.received % 4) as usize];
                    self.control.push(byte)?;
                    self.received += 1;

                    if self.received == self.frame.payload_length {
                        self.control.complete()?;
                        self.stage = WsStage::Complete;
                        return Ok(Progress::Complete { consumed: pos });
                    }
                }
                WsStage::Payload | WsStage::Complete => unreachable!("handled before byte dispatch"),
            }
        }

        Ok(Progress::Continue)
    }

    fn parse_first_byte(&mut self, ch: u8) -> Result<(), ParseError> {
        self.frame.fin = ch & 0x80 != 0;
        self.frame.rsv1 = ch & 0x40 != 0;
        self.frame.rsv2 = ch & 0x20 != 0;
        self.frame.rsv3 = ch & 0x10 != 0;
        self.frame.opcode = Opcode::from_u8(ch & 0x0F).ok_or(ParseError::BadRequest)?;

        if self.frame.rsv1 || self.frame.rsv2 || self.frame.rsv3 {
            return Err(ParseError::BadRequest);
        }

        match self.frame.opcode {
            Opcode::Close => {
                if !self.frame.fin {
                    return Err(ParseError::BadRequest);
                }
                self.context.resettable = true;
            }
            Opcode::Ping | Opcode::Pong => {
                if !self.frame.fin {
                    return Err(ParseError::BadRequest);
                }
            }
            Opcode::Continuation => {
                if self.context.kind.is_none() {
                    return Err(ParseError::BadRequest);
                }
                self.context.resettable = self.frame.fin;
            }
            Opcode::Text | Opcode::Binary => {
                if self.context.kind.is_some() {
                    return Err(ParseError::BadRequest);
                }
                self.context.kind = Some(self.frame.opcode);
                if !self.frame.fin {
                    self.context.fragmented = true;
                }
                self.context.resettable = self.frame.fin;
            }
        }

        Ok(())
    }

    /// Reads a big-endian length of `byte_count` bytes, most significant
    /// byte first.
    fn set_payload_length(&mut self, byte_count: usize) -> Result<(), ParseError> {
        self.buf.complete()?;
        let bytes = self.buf.get();

        let mut length: u64 = 0;
        for &b in &bytes[..byte_count] {
            length = (length << 8) | b as u64;
        }
        self.buf.reset();

        if length >> 63 != 0 {
            return Err(ParseError::BadRequest);
        }
        if self.frame.opcode.is_control() && length > MAX_CONTROL_PAYLOAD {
            return Err(ParseError::BadRequest);
        }

        self.frame.payload_length = length;
        Ok(())
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}
