//! Outcome taxonomy shared by every protocol parser.

use std::fmt;

use crate::buffer::OutOfMemory;

/// Result of feeding one slice of bytes to a parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// All bytes were consumed and the unit is not finished yet.
    Continue,
    /// The unit is finished; `consumed` bytes of the slice belong to it.
    Complete { consumed: usize },
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        matches!(self, Progress::Complete { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Malformed input or a protocol violation.
    BadRequest,
    /// A configured size limit was exceeded.
    PayloadTooLarge,
    /// The Host header did not resolve to a configured virtual host.
    HostNotFound,
    /// Allocation failed while the unit was being assembled.
    OutOfMemory,
    /// Redirect resolution hit the hop limit.
    RedirectLoop,
}

impl ParseError {
    /// HTTP status code sent back for this outcome.
    pub fn status_code(&self) -> u16 {
        match self {
            ParseError::BadRequest => 400,
            ParseError::HostNotFound => 404,
            ParseError::PayloadTooLarge => 413,
            ParseError::OutOfMemory => 500,
            ParseError::RedirectLoop => 508,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::BadRequest => write!(f, "malformed input"),
            ParseError::PayloadTooLarge => write!(f, "payload exceeds the configured limit"),
            ParseError::HostNotFound => write!(f, "host not found"),
            ParseError::OutOfMemory => write!(f, "out of memory"),
            ParseError::RedirectLoop => write!(f, "redirect loop detected"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<OutOfMemory> for ParseError {
    fn from(_: OutOfMemory) -> Self {
        ParseError::OutOfMemory
    }
}
