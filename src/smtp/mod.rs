//! Outbound mail.
//!
//! [`parser`] reads `###-text` / `### text` reply lines incrementally;
//! [`client`] drives the command sequence over a blocking socket and
//! switches between the SmtpCommand, SmtpTls and SmtpContent roles.

pub mod client;
pub mod parser;

pub use client::{SmtpClient, SmtpError, SmtpReply, send_mail, send_mail_async};
pub use parser::ReplyParser;
