//! Virtual hosts and the domain templates that select them.
//!
//! A domain template is a hostname where `*` may open or close the name
//! (`*.example.com`, `api.*`) and where bracketed groups are passed through
//! as regex (`(www|api).example.com`). Dots outside brackets are literal.

use std::fmt;

use regex::Regex;

use crate::http::parser::HostResolver;
use crate::http::redirect::RedirectRule;
use crate::http::request::Method;
use crate::http::route::{HttpHandler, Router, TemplateError};
use crate::websocket::session::WsHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    MisplacedAsterisk(String),
    UnbalancedBrackets(String),
    Regex(String),
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainError::MisplacedAsterisk(t) => {
                write!(f, "asterisk must be at the start or end of \"{}\"", t)
            }
            DomainError::UnbalancedBrackets(t) => write!(f, "unbalanced brackets in \"{}\"", t),
            DomainError::Regex(e) => write!(f, "invalid domain expression: {}", e),
        }
    }
}

impl std::error::Error for DomainError {}

#[derive(Debug, Clone)]
pub struct DomainTemplate {
    template: String,
    exact: bool,
    regex: Regex,
}

impl DomainTemplate {
    pub fn new(template: &str) -> Result<Self, DomainError> {
        let pattern = prepare(template)?;
        let regex = Regex::new(&format!("(?i){}", pattern))
            .map_err(|e| DomainError::Regex(e.to_string()))?;
        let exact = !template.contains(['*', '(', '[', '^', '$', '|', '?', '+', '\\']);

        Ok(Self {
            template: template.to_string(),
            exact,
            regex,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn is_exact(&self) -> bool {
        self.exact
    }

    pub fn matches(&self, host: &str) -> bool {
        if self.exact {
            return self.template.eq_ignore_ascii_case(host);
        }
        self.regex.is_match(host)
    }
}

fn prepare(template: &str) -> Result<String, DomainError> {
    let anchored_start = template.starts_with('^');
    let anchored_end = template.ends_with('$');
    let last = template.chars().count().saturating_sub(1);

    let mut out = String::new();
    if !anchored_start {
        out.push('^');
    }

    let mut brackets = 0usize;
    for (pos, ch) in template.chars().enumerate() {
        match ch {
            '(' | '[' => {
                brackets += 1;
                out.push(ch);
            }
            ')' | ']' => {
                if brackets == 0 {
                    return Err(DomainError::UnbalancedBrackets(template.to_string()));
                }
                brackets -= 1;
                out.push(ch);
            }
            '*' if brackets > 0 => out.push(ch),
            '*' => {
                if pos != 0 && pos != last {
                    return Err(DomainError::MisplacedAsterisk(template.to_string()));
                }
                out.push_str(".*");
            }
            '.' if brackets > 0 => out.push(ch),
            '.' => out.push_str("\\."),
            _ => out.push(ch),
        }
    }

    if brackets != 0 {
        return Err(DomainError::UnbalancedBrackets(template.to_string()));
    }
    if !anchored_end {
        out.push('$');
    }

    Ok(out)
}

/// Configuration unit selected by Host header or TLS SNI.
pub struct VirtualHost {
    pub name: String,
    domains: Vec<DomainTemplate>,
    pub routes: Router<HttpHandler>,
    pub websockets: Router<WsHandler>,
    pub redirects: Vec<RedirectRule>,
}

impl VirtualHost {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domains: Vec::new(),
            routes: Router::new(),
            websockets: Router::new(),
            redirects: Vec::new(),
        }
    }

    pub fn add_domain(&mut self, template: &str) -> Result<(), DomainError> {
        self.domains.push(DomainTemplate::new(template)?);
        Ok(())
    }

    pub fn add_route(&mut self, template: &str, method: Method, handler: HttpHandler) -> Result<(), TemplateError> {
        self.routes.add(template, method, handler)
    }

    pub fn add_websocket(&mut self, template: &str, handler: WsHandler) -> Result<(), TemplateError> {
        self.websockets.add(template, Method::GET, handler)
    }

    pub fn add_redirect(&mut self, rule: RedirectRule) {
        self.redirects.push(rule);
    }

    pub fn domains(&self) -> &[DomainTemplate] {
        &self.domains
    }
}

/// All virtual hosts served by one listener, in configuration order.
#[derive(Default)]
pub struct HostTable {
    hosts: Vec<VirtualHost>,
}

impl HostTable {
    pub fn new() -> Self {
        Self { hosts: Vec::new() }
    }

    /// Adds a host and returns its index.
    pub fn add(&mut self, host: VirtualHost) -> usize {
        self.hosts.push(host);
        self.hosts.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&VirtualHost> {
        self.hosts.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut VirtualHost> {
        self.hosts.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Finds the host serving `name`. Exact domains win over templates.
    pub fn find(&self, name: &str) -> Option<usize> {
        let exact = self.hosts.iter().position(|h| {
            h.domains.iter().any(|d| d.is_exact() && d.matches(name))
        });
        exact.or_else(|| {
            self.hosts.iter().position(|h| {
                h.domains.iter().any(|d| !d.is_exact() && d.matches(name))
            })
        })
    }
}

impl HostResolver for HostTable {
    fn resolve(&self, host: &str) -> Option<usize> {
        self.find(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_prefix() {
        let d = DomainTemplate::new("*.example.com").unwrap();
        assert!(d.matches("api.example.com"));
        assert!(!d.matches("example.org"));
    }

    #[test]
    fn asterisk_in_the_middle_is_rejected() {
        assert!(matches!(
            DomainTemplate::new("api.*.com"),
            Err(DomainError::MisplacedAsterisk(_))
        ));
    }

    #[test]
    fn exact_beats_template() {
        let mut table = HostTable::new();
        let mut wild = VirtualHost::new("wild");
        wild.add_domain("*.example.com").unwrap();
        let mut api = VirtualHost::new("api");
        api.add_domain("api.example.com").unwrap();
        table.add(wild);
        table.add(api);

        assert_eq!(table.find("api.example.com"), Some(1));
        assert_eq!(table.find("www.example.com"), Some(0));
        assert_eq!(table.find("example.net"), None);
    }
}
