//! URI rewrite rules applied before route lookup.
//!
//! A rule pairs a regex `location` with a destination template in which
//! `#N` inserts capture group `N`. Rules are tried in order; whenever one
//! matches, the URI is rewritten and the search restarts from the first
//! rule. An absolute destination ends the search with an external redirect.

use std::fmt;

use regex::Regex;
use tracing::warn;

use crate::error::ParseError;
use crate::http::request::Request;

/// Rewrites allowed before resolution is declared a loop.
pub const MAX_REDIRECT_HOPS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectError {
    EmptyParamName(String),
    Regex(String),
}

impl fmt::Display for RedirectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedirectError::EmptyParamName(d) => write!(f, "empty param name in \"{}\"", d),
            RedirectError::Regex(e) => write!(f, "invalid location: {}", e),
        }
    }
}

impl std::error::Error for RedirectError {}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Group(usize),
}

#[derive(Debug, Clone)]
pub struct RedirectRule {
    location: Regex,
    destination: String,
    segments: Vec<Segment>,
}

impl RedirectRule {
    pub fn new(location: &str, destination: &str) -> Result<Self, RedirectError> {
        let location = Regex::new(location).map_err(|e| RedirectError::Regex(e.to_string()))?;
        let segments = parse_destination(destination)?;

        Ok(Self {
            location,
            destination: destination.to_string(),
            segments,
        })
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Builds the rewritten URI when `path` matches. Unknown groups expand to
    /// nothing.
    pub fn apply(&self, path: &str) -> Option<String> {
        let caps = self.location.captures(path)?;
        let mut out = String::new();

        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Group(n) => {
                    if let Some(m) = caps.get(*n) {
                        out.push_str(m.as_str());
                    }
                }
            }
        }

        Some(out)
    }
}

fn parse_destination(destination: &str) -> Result<Vec<Segment>, RedirectError> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut chars = destination.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '#' {
            text.push(ch);
            continue;
        }

        let mut digits = String::new();
        while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
            digits.push(d);
            chars.next();
        }

        let group: usize = digits
            .parse()
            .map_err(|_| RedirectError::EmptyParamName(destination.to_string()))?;

        if !text.is_empty() {
            segments.push(Segment::Text(std::mem::take(&mut text)));
        }
        segments.push(Segment::Group(group));
    }

    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }

    Ok(segments)
}

/// Result of running the redirect table against a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectOutcome {
    /// No rule applied, or internal rewrites finished after `hops` rewrites.
    Resolved { hops: usize },
    /// Destination is absolute; answer with 301 and close.
    External(String),
}

/// Applies `rules` to `request`, rewriting its URI in place.
///
/// Fails with [`ParseError::RedirectLoop`] once a tenth successive rewrite
/// would be needed, and with `BadRequest` when a rewrite produces a URI the
/// request cannot carry.
pub fn resolve(rules: &[RedirectRule], request: &mut Request) -> Result<RedirectOutcome, ParseError> {
    let mut loop_cycle = 1;

    'restart: loop {
        for rule in rules {
            let Some(uri) = rule.apply(&request.path) else {
                continue;
            };

            if loop_cycle >= MAX_REDIRECT_HOPS {
                warn!(path = %request.path, hops = loop_cycle, "redirect loop detected");
                return Err(ParseError::RedirectLoop);
            }

            if is_external(&uri) {
                return Ok(RedirectOutcome::External(uri));
            }

            request.set_uri(&uri)?;
            loop_cycle += 1;
            continue 'restart;
        }

        return Ok(RedirectOutcome::Resolved { hops: loop_cycle - 1 });
    }
}

fn is_external(uri: &str) -> bool {
    !uri.starts_with('/') && url::Url::parse(uri).is_ok()
}
