//! Script files: the on-disk record of traffic used to drive replay.
//!
//! ```text
//! <-CMD:['prog','arg1']
//! ->OUT:stdout text
//! ->EXC:0
//! <-[4]SRV:ready
//! ```
//!
//! Each entry starts with a direction marker and a three-letter tag; lines
//! without a marker continue the previous entry's payload. Every entry is
//! written with a terminating newline and one terminator is stripped on
//! load, so payloads (including their own trailing newlines) survive a round
//! trip unchanged.

use crate::error::{MockError, Result};
use crate::patterns::{command_item, function_item, RE_SCRIPT_ENTRY};
use crate::traffic::{Direction, Response, ResponseKind, RequestTag};
use fs_err as fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One request with the responses recorded for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBlock {
    pub number: u64,
    pub tag: RequestTag,
    pub text: String,
    pub responses: Vec<Response>,
}

impl RequestBlock {
    pub fn description(&self) -> String {
        format!("{}{}:{}", Direction::Request.marker(), self.tag.tag(), self.text)
    }

    /// Script text for this block, optionally carrying the request number.
    pub fn render(&self, numbered: bool) -> String {
        let mut out = String::from(Direction::Request.marker());
        if numbered {
            out.push_str(&format!("[{}]", self.number));
        }
        out.push_str(self.tag.tag());
        out.push(':');
        out.push_str(&self.text);
        out.push('\n');
        for response in &self.responses {
            out.push_str(&response.description());
            out.push('\n');
        }
        out
    }
}

pub fn load(path: &Path) -> Result<Vec<RequestBlock>> {
    let text = fs::read_to_string(path)
        .map_err(|err| MockError::io(format!("Failed to read script {}", path.display()), err))?;
    parse(&text, path)
}

pub fn parse(text: &str, path: &Path) -> Result<Vec<RequestBlock>> {
    let malformed = |line: usize, details: String| MockError::ScriptMalformed {
        path: path.to_path_buf(),
        line,
        details,
    };

    let mut blocks: Vec<RequestBlock> = Vec::new();
    let mut last_number = 0u64;

    let body = text.strip_suffix('\n').unwrap_or(text);
    if body.is_empty() {
        return Ok(blocks);
    }

    for (index, line) in body.split('\n').enumerate() {
        let line_no = index + 1;
        let Some(caps) = RE_SCRIPT_ENTRY.captures(line) else {
            match last_payload(&mut blocks) {
                Some(payload) => {
                    payload.push('\n');
                    payload.push_str(line);
                }
                None if line.trim().is_empty() => {}
                None => {
                    return Err(malformed(
                        line_no,
                        "text before the first traffic entry".to_string(),
                    ))
                }
            }
            continue;
        };

        let payload = line[caps.get(0).map_or(0, |m| m.end())..].to_string();
        let tag = &caps[3];
        if &caps[1] == Direction::Request.marker() {
            let kind = RequestTag::from_tag(tag)
                .ok_or_else(|| malformed(line_no, format!("unknown request tag {}", tag)))?;
            let number = match caps.get(2) {
                Some(number) => {
                    let number: u64 = number.as_str().parse().map_err(|_| {
                        malformed(line_no, format!("invalid request number {}", number.as_str()))
                    })?;
                    // Concatenated sessions each number from 1 again.
                    if number <= last_number {
                        tracing::debug!(
                            line = line_no,
                            number,
                            last = last_number,
                            "Request numbering restarts; reading a new run"
                        );
                    }
                    number
                }
                None => last_number + 1,
            };
            last_number = number;
            blocks.push(RequestBlock {
                number,
                tag: kind,
                text: payload,
                responses: Vec::new(),
            });
        } else {
            let kind = ResponseKind::from_tag(tag)
                .ok_or_else(|| malformed(line_no, format!("unknown response tag {}", tag)))?;
            if caps.get(2).is_some() {
                return Err(malformed(
                    line_no,
                    "responses cannot carry request numbers".to_string(),
                ));
            }
            let block = blocks.last_mut().ok_or_else(|| {
                malformed(line_no, "response appears before any request".to_string())
            })?;
            block.responses.push(Response::new(kind, payload));
        }
    }

    Ok(blocks)
}

/// The payload that continuation lines extend: the last response of the last
/// block, or its request text when it has no responses yet.
fn last_payload(blocks: &mut [RequestBlock]) -> Option<&mut String> {
    let block = blocks.last_mut()?;
    match block.responses.last_mut() {
        Some(response) => Some(&mut response.text),
        None => Some(&mut block.text),
    }
}

/// Renders blocks as script text.
pub fn render(blocks: &[RequestBlock], numbered: bool) -> String {
    blocks.iter().map(|block| block.render(numbered)).collect()
}

/// Appends request blocks to a script file, one write per block.
pub struct ScriptWriter {
    path: PathBuf,
    file: fs::File,
    numbered: bool,
}

impl ScriptWriter {
    /// Creates (or truncates) the script at `path`.
    pub fn create(path: &Path, numbered: bool) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| MockError::io("Failed to create record directory", err))?;
        }
        let file = fs::File::create(path)
            .map_err(|err| MockError::io("Failed to create record file", err))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            numbered,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, block: &RequestBlock) -> Result<()> {
        let text = block.render(self.numbered);
        self.file
            .write_all(text.as_bytes())
            .and_then(|()| self.file.flush())
            .map_err(|err| MockError::io("Failed to append to record file", err))
    }
}

/// The intercepts that occur in a replay script. When non-empty, only those
/// intercepts are replayed and everything else is recorded afresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayItems {
    items: Vec<String>,
}

impl ReplayItems {
    pub fn new(items: Vec<String>) -> Self {
        Self { items }
    }

    /// Derives the items by searching the script's request lines for each
    /// configured command and function intercept.
    pub fn from_script<'a, I>(commands: &[String], functions: &[String], lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let invalid = |name: &str, err: regex::Error| MockError::ConfigInvalidOption {
            section: "intercepts".to_string(),
            option: name.to_string(),
            details: err.to_string(),
        };
        let mut patterns = Vec::new();
        for command in commands {
            patterns.push((command, command_item(command).map_err(|err| invalid(command, err))?));
        }
        for function in functions {
            patterns.push((
                function,
                function_item(function).map_err(|err| invalid(function, err))?,
            ));
        }

        let mut items: Vec<String> = Vec::new();
        for line in lines {
            for (name, pattern) in &patterns {
                if !items.iter().any(|item| item == *name) && pattern.is_match(line) {
                    items.push(name.to_string());
                }
            }
        }
        Ok(Self { items })
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// Whether a request with item name `name` should be replayed. Dotted
    /// function names match their enclosing items.
    pub fn contains(&self, name: &str) -> bool {
        self.items.iter().any(|item| {
            name == item
                || name
                    .strip_prefix(item.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}
