//! Python-style `repr` rendering and parsing for argv lists and environments.
//!
//! Envelopes and scripts carry argv as `['echo','hi']` and environments as
//! `{'HOME':'/home/me'}`. Rendering always uses single quotes and no spaces
//! after separators so the same argv always renders to the same text.
//! Parsing is lenient: either quote style, optional `u` prefixes and
//! whitespace between items are accepted.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::ErrorInfo;

pub fn render_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

pub fn render_list<S: AsRef<str>>(items: &[S]) -> String {
    let rendered: Vec<String> = items.iter().map(|item| render_str(item.as_ref())).collect();
    format!("[{}]", rendered.join(","))
}

pub fn render_dict(entries: &BTreeMap<String, String>) -> String {
    let rendered: Vec<String> = entries
        .iter()
        .map(|(key, value)| format!("{}:{}", render_str(key), render_str(value)))
        .collect();
    format!("{{{}}}", rendered.join(","))
}

pub fn parse_list(text: &str) -> Result<Vec<String>, ErrorInfo> {
    let mut parser = Parser::new(text);
    let items = parser.list()?;
    parser.finish()?;
    Ok(items)
}

pub fn parse_dict(text: &str) -> Result<BTreeMap<String, String>, ErrorInfo> {
    let mut parser = Parser::new(text);
    let entries = parser.dict()?;
    parser.finish()?;
    Ok(entries)
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    text: &'a str,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.char_indices().peekable(),
            text,
        }
    }

    fn error(&self, message: impl Into<String>) -> ErrorInfo {
        ErrorInfo::new(
            "invalid_repr",
            format!("{} in {:?}", message.into(), self.text),
        )
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn expect(&mut self, wanted: char) -> Result<(), ErrorInfo> {
        self.skip_whitespace();
        match self.chars.next() {
            Some((_, c)) if c == wanted => Ok(()),
            Some((index, c)) => Err(self.error(format!(
                "expected '{}' but found '{}' at offset {}",
                wanted, c, index
            ))),
            None => Err(self.error(format!("expected '{}' but input ended", wanted))),
        }
    }

    /// Consumes a closing delimiter or a separating comma. Returns true when
    /// the sequence is closed.
    fn separator_or_close(&mut self, close: char) -> Result<bool, ErrorInfo> {
        self.skip_whitespace();
        match self.chars.next() {
            Some((_, c)) if c == close => Ok(true),
            Some((_, ',')) => {
                self.skip_whitespace();
                if matches!(self.chars.peek(), Some((_, c)) if *c == close) {
                    self.chars.next();
                    return Ok(true);
                }
                Ok(false)
            }
            Some((index, c)) => Err(self.error(format!(
                "expected ',' or '{}' but found '{}' at offset {}",
                close, c, index
            ))),
            None => Err(self.error("unterminated sequence")),
        }
    }

    fn list(&mut self) -> Result<Vec<String>, ErrorInfo> {
        self.expect('[')?;
        let mut items = Vec::new();
        self.skip_whitespace();
        if matches!(self.chars.peek(), Some((_, ']'))) {
            self.chars.next();
            return Ok(items);
        }
        loop {
            items.push(self.string()?);
            if self.separator_or_close(']')? {
                return Ok(items);
            }
        }
    }

    fn dict(&mut self) -> Result<BTreeMap<String, String>, ErrorInfo> {
        self.expect('{')?;
        let mut entries = BTreeMap::new();
        self.skip_whitespace();
        if matches!(self.chars.peek(), Some((_, '}'))) {
            self.chars.next();
            return Ok(entries);
        }
        loop {
            let key = self.string()?;
            self.expect(':')?;
            let value = self.string()?;
            entries.insert(key, value);
            if self.separator_or_close('}')? {
                return Ok(entries);
            }
        }
    }

    fn string(&mut self) -> Result<String, ErrorInfo> {
        self.skip_whitespace();
        if matches!(self.chars.peek(), Some((_, 'u')) | Some((_, 'b'))) {
            self.chars.next();
        }
        let quote = match self.chars.next() {
            Some((_, c @ ('\'' | '"'))) => c,
            Some((index, c)) => {
                return Err(self.error(format!(
                    "expected a quoted string but found '{}' at offset {}",
                    c, index
                )))
            }
            None => return Err(self.error("expected a quoted string but input ended")),
        };

        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some((_, c)) if c == quote => return Ok(out),
                Some((_, '\\')) => out.push(self.escape()?),
                Some((_, c)) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn escape(&mut self) -> Result<char, ErrorInfo> {
        match self.chars.next() {
            Some((_, 'n')) => Ok('\n'),
            Some((_, 'r')) => Ok('\r'),
            Some((_, 't')) => Ok('\t'),
            Some((_, '0')) => Ok('\0'),
            Some((_, 'x')) => self.hex_escape(2),
            Some((_, 'u')) => self.hex_escape(4),
            Some((_, c)) => Ok(c),
            None => Err(self.error("dangling escape")),
        }
    }

    fn hex_escape(&mut self, digits: usize) -> Result<char, ErrorInfo> {
        let mut code = 0u32;
        for _ in 0..digits {
            let digit = self
                .chars
                .next()
                .and_then(|(_, c)| c.to_digit(16))
                .ok_or_else(|| self.error("invalid hex escape"))?;
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or_else(|| self.error("invalid character code"))
    }

    fn finish(&mut self) -> Result<(), ErrorInfo> {
        self.skip_whitespace();
        match self.chars.next() {
            None => Ok(()),
            Some((index, c)) => Err(self.error(format!(
                "unexpected trailing '{}' at offset {}",
                c, index
            ))),
        }
    }
}
