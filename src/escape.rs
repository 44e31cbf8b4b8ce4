//! Quoting of identifiers and literals for interpolation into SQL text.
//!
//! The session prefers the handle's own escaping (which knows the server's
//! `standard_conforming_strings` setting) and falls back to the plain
//! algorithms here when the handle offers none.

use crate::driver::{Driver, Handle};
use crate::error::Result;
use crate::session::Session;

/// `"name"` with embedded double quotes doubled.
pub fn quote_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Literal quoting as libpq's `PQescapeLiteral` does it: single quotes are
/// doubled and, if the value holds a backslash, the `E'...'` form is used
/// with backslashes doubled. Valid whatever `standard_conforming_strings` is.
pub fn quote_literal(value: &str) -> String {
    let has_backslash = value.contains('\\');
    let mut out = String::with_capacity(value.len() + 3);
    if has_backslash {
        out.push('E');
    }
    out.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            out.push(c);
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Body of a string literal, without quotes. Backslashes are only special
/// when `standard_conforming_strings` is off.
pub fn escape_string(value: &str, standard_conforming_strings: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\'' || (c == '\\' && !standard_conforming_strings) {
            out.push(c);
        }
        out.push(c);
    }
    out
}

impl<D: Driver> Session<D> {
    /// Quote a database object name. Establishes the handle if needed.
    pub fn escape_identifier(&mut self, name: &str) -> Result<String> {
        let handle = self.handle()?;
        Ok(handle
            .escape_identifier(name)
            .unwrap_or_else(|| quote_identifier(name)))
    }

    /// Quote a text value. Establishes the handle if needed.
    pub fn escape_literal(&mut self, value: &str) -> Result<String> {
        let handle = self.handle()?;
        Ok(handle
            .escape_literal(value)
            .unwrap_or_else(|| format!("'{}'", handle.escape_string(value))))
    }
}
