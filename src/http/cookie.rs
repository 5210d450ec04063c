//! `Cookie` header sub-parser.

use crate::buffer::ByteAccumulator;
use crate::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Key,
    Value,
    Space,
}

/// Splits a `Cookie` header value into ordered `(name, value)` pairs.
///
/// Pairs are separated by `;` followed by optional spaces. A trailing name
/// without `=` is dropped rather than turned into an empty pair.
pub fn parse_cookies(header: &str) -> Result<Vec<(String, String)>, ParseError> {
    let mut cookies = Vec::new();
    let mut stage = Stage::Key;
    let mut key = String::new();
    let mut buf: ByteAccumulator<256> = ByteAccumulator::new();

    for &ch in header.as_bytes() {
        if stage == Stage::Space {
            if ch == b' ' {
                continue;
            }
            stage = Stage::Key;
        }

        match stage {
            Stage::Key => {
                if ch == b'=' {
                    key = take_token(&mut buf)?;
                    stage = Stage::Value;
                } else if ch == b';' {
                    buf.reset();
                    stage = Stage::Space;
                } else {
                    buf.push(ch)?;
                }
            }
            Stage::Value => {
                if ch == b';' {
                    let value = take_token(&mut buf)?;
                    cookies.push((std::mem::take(&mut key), value));
                    stage = Stage::Space;
                } else {
                    buf.push(ch)?;
                }
            }
            Stage::Space => {}
        }
    }

    if stage == Stage::Value {
        let value = take_token(&mut buf)?;
        cookies.push((key, value));
    }

    Ok(cookies)
}

fn take_token<const N: usize>(buf: &mut ByteAccumulator<N>) -> Result<String, ParseError> {
    buf.complete()?;
    let token = buf.as_str().ok_or(ParseError::BadRequest)?.to_string();
    buf.reset();
    Ok(token)
}
