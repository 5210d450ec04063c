use bytes::{BufMut, BytesMut};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Close status sent when the peer violates the framing rules.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// Header of one received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub mask: [u8; 4],
    pub payload_length: u64,
}

impl Default for Frame {
    fn default() -> Self {
        Self {
            fin: false,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: Opcode::Continuation,
            masked: false,
            mask: [0; 4],
            payload_length: 0,
        }
    }
}

/// XORs `bytes` in place with `mask`, where `bytes[0]` sits at `offset`
/// within the frame payload.
pub fn apply_mask(mask: [u8; 4], offset: u64, bytes: &mut [u8]) {
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte ^= mask[((offset + i as u64) % 4) as usize];
    }
}

/// Appends an unmasked server frame.
pub fn encode_frame(fin: bool, opcode: Opcode, payload: &[u8], out: &mut BytesMut) {
    let first = (if fin { 0x80u8 } else { 0x00 }) | opcode.as_u8();
    out.put_u8(first);

    let len = payload.len();
    if len < 126 {
        out.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(127);
        out.put_u64(len as u64);
    }

    out.put_slice(payload);
}

/// Appends a masked client frame. Used by clients and tests.
pub fn encode_masked_frame(fin: bool, opcode: Opcode, payload: &[u8], mask: [u8; 4], out: &mut BytesMut) {
    let first = (if fin { 0x80u8 } else { 0x00 }) | opcode.as_u8();
    out.put_u8(first);

    let len = payload.len();
    if len < 126 {
        out.put_u8(0x80 | len as u8);
    } else if len <= u16::MAX as usize {
        out.put_u8(0x80 | 126);
        out.put_u16(len as u16);
    } else {
        out.put_u8(0x80 | 127);
        out.put_u64(len as u64);
    }

    out.put_slice(&mask);
    let start = out.len();
    out.put_slice(payload);
    apply_mask(mask, 0, &mut out[start..]);
}

/// Close frame body: status code followed by an optional reason.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}
