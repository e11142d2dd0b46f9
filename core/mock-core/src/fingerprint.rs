//! Normalized request identities used for matching live traffic to scripts.
//!
//! Matching is exact equality of fingerprints. All normalization happens
//! here, and every rule is idempotent: fingerprinting the text of a
//! fingerprint yields the same fingerprint.
//!
//! Command-line rules:
//! - the argv repr is parsed and re-rendered in canonical form;
//! - the program is reduced to its basename;
//! - every literal prefix listed in `strip_prefixes` (looked up in
//!   `[<program>]`, then `[command line]`) is removed from each argument
//!   until none remains;
//! - an `env 'K=V' ...` prefix is kept with its whitespace collapsed;
//! - text that does not parse falls back to whitespace collapsing.

use crate::config::{RcConfig, COMMAND_LINE_SECTION};
use crate::traffic::{program_name, Request, RequestTag};
use capturemock_protocol::repr;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub tag: RequestTag,
    pub text: String,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag.tag(), self.text)
    }
}

/// Computes fingerprints using the rc configuration's normalization rules.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer<'a> {
    config: &'a RcConfig,
}

impl<'a> Normalizer<'a> {
    pub fn new(config: &'a RcConfig) -> Self {
        Self { config }
    }

    pub fn request(&self, request: &Request) -> Fingerprint {
        self.text(request.tag(), &request.text())
    }

    pub fn text(&self, tag: RequestTag, text: &str) -> Fingerprint {
        let text = match tag {
            RequestTag::CommandLine => self.command_line(text),
            RequestTag::FunctionCall => function_call(text),
            RequestTag::ServerState => text.trim().to_string(),
            RequestTag::ClientSocket | RequestTag::CommandKill => text.to_string(),
        };
        Fingerprint { tag, text }
    }

    fn command_line(&self, text: &str) -> String {
        let collapsed = collapse_whitespace(text);
        let Some((env_part, argv)) = split_command(text).or_else(|| split_command(&collapsed))
        else {
            return collapse_whitespace(text);
        };

        let mut normalized = String::new();
        let env_part = collapse_whitespace(env_part);
        if !env_part.is_empty() {
            normalized.push_str(&env_part);
            normalized.push(' ');
        }

        let mut argv = argv;
        if let Some(program) = argv.first_mut() {
            *program = program_name(program).to_string();
            let sections = [program.as_str(), COMMAND_LINE_SECTION];
            let prefixes = self.config.get_list("strip_prefixes", &sections);
            for arg in argv.iter_mut().skip(1) {
                *arg = strip_prefixes(arg, &prefixes);
            }
        }
        normalized.push_str(&repr::render_list(&argv));
        normalized
    }
}

/// Splits `env 'K=V' ['prog','arg']` into the env prefix and parsed argv.
/// The argv list starts at the first `[` (at the start or after whitespace)
/// from which the remainder parses as a list.
fn split_command(text: &str) -> Option<(&str, Vec<String>)> {
    let mut previous: Option<char> = None;
    for (index, ch) in text.char_indices() {
        if ch == '[' && previous.map_or(true, char::is_whitespace) {
            if let Ok(argv) = repr::parse_list(&text[index..]) {
                return Some((&text[..index], argv));
            }
        }
        previous = Some(ch);
    }
    None
}

/// Removes every occurrence of each prefix until none remains.
pub fn strip_prefixes(arg: &str, prefixes: &[String]) -> String {
    let mut current = arg.to_string();
    loop {
        let mut changed = false;
        for prefix in prefixes.iter().filter(|prefix| !prefix.is_empty()) {
            if current.contains(prefix.as_str()) {
                current = current.replace(prefix.as_str(), "");
                changed = true;
            }
        }
        if !changed {
            return current;
        }
    }
}

/// `name(args)` with the arguments re-serialized as canonical JSON.
fn function_call(text: &str) -> String {
    canonical_call(text).unwrap_or_else(|| {
        let collapsed = collapse_whitespace(text);
        canonical_call(&collapsed).unwrap_or(collapsed)
    })
}

fn canonical_call(text: &str) -> Option<String> {
    let (name, rest) = text.split_once('(')?;
    let inner = rest.strip_suffix(')')?;
    let value: serde_json::Value = serde_json::from_str(&format!("[{}]", inner)).ok()?;
    let rendered = serde_json::to_string(&value).ok()?;
    let args = rendered.strip_prefix('[')?.strip_suffix(']')?;
    Some(format!("{}({})", name.trim(), args))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
