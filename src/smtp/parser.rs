//! Incremental SMTP reply parser.
//!
//! ```text
//! 250-first line\r\n      Status -'-'-> ContinueMessage -'\n'-> Status
//! 250 final line\r\n      Status -' '-> Message -'\n'-> Complete
//! ```
//!
//! Only the final line becomes the reply message (with its CRLF). The text
//! of continuation lines is kept separately for logging.

use crate::buffer::ByteAccumulator;
use crate::error::{ParseError, Progress};

/// Longest line the parser accepts, status code included.
pub const MESSAGE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpStage {
    Status,
    Message,
    ContinueMessage,
    Complete,
}

pub struct ReplyParser {
    stage: SmtpStage,
    buf: ByteAccumulator<MESSAGE_CAPACITY>,
    line_size: usize,
    status: u16,
    message: String,
    continuation: Vec<String>,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self {
            stage: SmtpStage::Status,
            buf: ByteAccumulator::new(),
            line_size: 0,
            status: 0,
            message: String::new(),
            continuation: Vec::new(),
        }
    }

    pub fn stage(&self) -> SmtpStage {
        self.stage
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Final line text, including the trailing CRLF.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Text of the `###-` lines preceding the final one, without CRLF.
    pub fn continuation(&self) -> &[String] {
        &self.continuation
    }

    pub fn reset(&mut self) {
        self.stage = SmtpStage::Status;
        self.buf.reset();
        self.line_size = 0;
        self.status = 0;
        self.message.clear();
        self.continuation.clear();
    }

    pub fn run(&mut self, data: &[u8]) -> Result<Progress, ParseError> {
        if self.stage == SmtpStage::Complete {
            return Ok(Progress::Complete { consumed: 0 });
        }

        for (pos, &ch) in data.iter().enumerate() {
            if ch == 0 {
                return Err(ParseError::BadRequest);
            }

            match self.stage {
                SmtpStage::Status => {
                    if ch == b' ' || ch == b'-' {
                        self.set_status()?;
                        self.line_size += 1;
                        self.stage = if ch == b' ' {
                            SmtpStage::Message
                        } else {
                            SmtpStage::ContinueMessage
                        };
                    } else {
                        self.push(ch)?;
                    }
                }
                SmtpStage::ContinueMessage => {
                    if ch == b'\n' {
                        self.push_continuation()?;
                        self.line_size = 0;
                        self.stage = SmtpStage::Status;
                    } else {
                        self.push(ch)?;
                    }
                }
                SmtpStage::Message => {
                    self.push(ch)?;
                    if ch == b'\n' {
                        self.set_message()?;
                        self.stage = SmtpStage::Complete;
                        return Ok(Progress::Complete { consumed: pos + 1 });
                    }
                }
                SmtpStage::Complete => unreachable!("checked on entry"),
            }
        }

        Ok(Progress::Continue)
    }

    fn push(&mut self, ch: u8) -> Result<(), ParseError> {
        if self.line_size >= MESSAGE_CAPACITY - 1 {
            return Err(ParseError::BadRequest);
        }
        self.buf.push(ch)?;
        self.line_size += 1;
        Ok(())
    }

    fn set_status(&mut self) -> Result<(), ParseError> {
        self.buf.complete()?;
        let digits = self.buf.get();

        if digits.len() != 3 || !digits.iter().all(u8::is_ascii_digit) {
            return Err(ParseError::BadRequest);
        }
        let status = digits
            .iter()
            .fold(0u16, |acc, d| acc * 10 + (d - b'0') as u16);
        if status == 0 {
            return Err(ParseError::BadRequest);
        }

        self.status = status;
        self.buf.reset();
        Ok(())
    }

    fn push_continuation(&mut self) -> Result<(), ParseError> {
        self.buf.complete()?;
        let line = String::from_utf8_lossy(self.buf.get());
        self.continuation.push(line.trim_end_matches('\r').to_string());
        self.buf.reset();
        Ok(())
    }

    fn set_message(&mut self) -> Result<(), ParseError> {
        self.buf.complete()?;
        let line = self.buf.get();

        if !line.ends_with(b"\r\n") {
            return Err(ParseError::BadRequest);
        }

        self.message = String::from_utf8_lossy(line).into_owned();
        self.buf.reset();
        Ok(())
    }
}

impl Default for ReplyParser {
    fn default() -> Self {
        Self::new()
    }
}
