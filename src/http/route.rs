//! Route table consulted once a request is fully parsed.
//!
//! Route templates are plain paths with parameters written as
//! `{name|regex}`, e.g. `/users/{id|\d+}/posts/{slug|[a-z-]+}`. Static text
//! is matched literally and the whole path is anchored.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::http::request::{Method, Request};
use crate::http::response::Response;

/// Application handler for an HTTP route.
pub type HttpHandler = Arc<dyn Fn(&Request, &mut Response) + Send + Sync>;

/// Wraps a closure as an [`HttpHandler`].
pub fn handler<F>(f: F) -> HttpHandler
where
    F: Fn(&Request, &mut Response) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    UnopenedToken(String),
    UnclosedToken(String),
    EmptyName(String),
    EmptyExpression(String),
    MultiWordName(String),
    Regex(String),
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateError::UnopenedToken(t) => write!(f, "unopened token in \"{}\"", t),
            TemplateError::UnclosedToken(t) => write!(f, "unclosed token in \"{}\"", t),
            TemplateError::EmptyName(t) => write!(f, "empty param name in \"{}\"", t),
            TemplateError::EmptyExpression(t) => write!(f, "empty param expression in \"{}\"", t),
            TemplateError::MultiWordName(t) => write!(f, "param name must be one word in \"{}\"", t),
            TemplateError::Regex(e) => write!(f, "invalid expression: {}", e),
        }
    }
}

impl std::error::Error for TemplateError {}

/// A template compiled to an anchored regex plus its parameter names in
/// capture-group order.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub regex: Regex,
    pub params: Vec<String>,
}

impl CompiledTemplate {
    /// Matches `path` and binds every capture to its parameter name.
    pub fn captures(&self, path: &str) -> Option<Vec<(String, String)>> {
        let caps = self.regex.captures(path)?;
        let params = self
            .params
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let value = caps.get(i + 1).map(|m| m.as_str()).unwrap_or("");
                (name.clone(), value.to_string())
            })
            .collect();
        Some(params)
    }
}

pub fn compile_template(template: &str) -> Result<CompiledTemplate, TemplateError> {
    let mut pattern = String::from("^");
    let mut params = Vec::new();
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' => {
                let (name, expr) = parse_token(&mut chars, template)?;
                params.push(name);
                pattern.push('(');
                pattern.push_str(&expr);
                pattern.push(')');
            }
            '}' => return Err(TemplateError::UnopenedToken(template.to_string())),
            '\\' if chars.peek() == Some(&'}') => {
                chars.next();
                pattern.push_str(&regex::escape("}"));
            }
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }

    pattern.push('$');

    let regex = Regex::new(&pattern).map_err(|e| TemplateError::Regex(e.to_string()))?;
    Ok(CompiledTemplate { regex, params })
}

/// Reads `name|expr}` after an opening brace. Braces inside the expression
/// nest; `\}` never closes the token.
fn parse_token<I>(chars: &mut std::iter::Peekable<I>, template: &str) -> Result<(String, String), TemplateError>
where
    I: Iterator<Item = char>,
{
    let mut name = String::new();
    let mut expr = String::new();
    let mut separator_found = false;
    let mut depth = 0usize;

    while let Some(ch) = chars.next() {
        if !separator_found {
            match ch {
                '|' => {
                    let trimmed = name.trim();
                    if trimmed.is_empty() {
                        return Err(TemplateError::EmptyName(template.to_string()));
                    }
                    if trimmed.contains(char::is_whitespace) {
                        return Err(TemplateError::MultiWordName(template.to_string()));
                    }
                    name = trimmed.to_string();
                    separator_found = true;
                }
                '{' | '}' => return Err(TemplateError::EmptyExpression(template.to_string())),
                _ => name.push(ch),
            }
            continue;
        }

        match ch {
            '{' => {
                depth += 1;
                expr.push(ch);
            }
            '}' if depth == 0 => {
                if expr.is_empty() {
                    return Err(TemplateError::EmptyExpression(template.to_string()));
                }
                return Ok((name, expr));
            }
            '}' => {
                depth -= 1;
                expr.push(ch);
            }
            '\\' => {
                expr.push(ch);
                if let Some(next) = chars.next() {
                    expr.push(next);
                }
            }
            _ => expr.push(ch),
        }
    }

    Err(TemplateError::UnclosedToken(template.to_string()))
}

enum Matcher {
    Static(String),
    Pattern(CompiledTemplate),
}

struct Route<H> {
    template: String,
    matcher: Matcher,
    handlers: HashMap<Method, H>,
}

/// Outcome of a route lookup.
pub enum RouteMatch<H> {
    Found {
        handler: H,
        params: Vec<(String, String)>,
    },
    MethodNotAllowed,
    NotFound,
}

/// Ordered route table. Static routes are always tried before templates;
/// templates are tried in registration order.
pub struct Router<H> {
    routes: Vec<Route<H>>,
}

impl<H: Clone> Router<H> {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Registers `handler` for `method` on `template`. Registering the same
    /// template again adds another method to the existing route.
    pub fn add(&mut self, template: &str, method: Method, handler: H) -> Result<(), TemplateError> {
        if let Some(route) = self.routes.iter_mut().find(|r| r.template == template) {
            route.handlers.insert(method, handler);
            return Ok(());
        }

        let matcher = if template.contains(['{', '}']) {
            Matcher::Pattern(compile_template(template)?)
        } else {
            Matcher::Static(template.to_string())
        };

        let mut handlers = HashMap::new();
        handlers.insert(method, handler);
        self.routes.push(Route {
            template: template.to_string(),
            matcher,
            handlers,
        });

        Ok(())
    }

    pub fn find(&self, path: &str, method: Method) -> RouteMatch<H> {
        let exact = self.routes.iter().find(|route| match &route.matcher {
            Matcher::Static(p) => p == path,
            Matcher::Pattern(_) => false,
        });

        let (route, params) = match exact {
            Some(route) => (route, Vec::new()),
            None => {
                let templated = self.routes.iter().find_map(|route| match &route.matcher {
                    Matcher::Pattern(t) => t.captures(path).map(|params| (route, params)),
                    Matcher::Static(_) => None,
                });
                match templated {
                    Some(found) => found,
                    None => return RouteMatch::NotFound,
                }
            }
        };

        match route.handlers.get(&method) {
            Some(handler) => RouteMatch::Found {
                handler: handler.clone(),
                params,
            },
            None => RouteMatch::MethodNotAllowed,
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<H: Clone> Default for Router<H> {
    fn default() -> Self {
        Self::new()
    }
}
