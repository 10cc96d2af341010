//! Parse error type with line/column tracking.

use alloc::string::{String, ToString};
use core::fmt;

/// Error produced when procedure text cannot be parsed or resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

/// Build a `ParseError` pointing at `remaining` within `full`.
pub(crate) fn parse_error(full: &str, remaining: &str, message: &str) -> ParseError {
    let consumed = full.len().saturating_sub(remaining.len());
    let consumed = &full[..consumed.min(full.len())];
    let line = consumed.matches('\n').count() + 1;
    let column = consumed
        .rsplit('\n')
        .next()
        .map(|s| s.len() + 1)
        .unwrap_or(1);
    ParseError {
        line,
        column,
        message: message.to_string(),
    }
}

/// Build a `ParseError` with no position (name-resolution failures).
pub(crate) fn resolve_error(message: String) -> ParseError {
    ParseError {
        line: 0,
        column: 0,
        message,
    }
}
