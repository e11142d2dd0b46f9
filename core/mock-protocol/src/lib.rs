//! Wire protocol shared by the CaptureMock server and its client shim.
//!
//! This crate is shared by both ends to prevent envelope drift. The server
//! remains the authority on validation, but the shim reuses the same types to
//! build envelopes and decode replies.
//!
//! Every connection carries exactly one UTF-8 message. Structured fields are
//! joined with [`SUT_SEP`]; command replies join stdout, stderr and the exit
//! code with [`CMD_SEP`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod repr;

pub const SUT_SEP: &str = ":SUT_SEP:";
pub const CMD_SEP: &str = "|TT_CMD_SEP|";
pub const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024; // 16MB

pub const COMMAND_LINE_PREFIX: &str = "SUT_COMMAND_LINE";
pub const COMMAND_KILL_PREFIX: &str = "SUT_COMMAND_KILL";
pub const SERVER_STATE_PREFIX: &str = "SUT_SERVER";
pub const FUNCTION_CALL_PREFIX: &str = "SUT_FUNCTION_CALL";
pub const TERMINATE_MESSAGE: &str = "TERMINATE_SERVER";

/// host:port of the mock server, consumed by the shim.
pub const SERVER_ENV: &str = "TEXTTEST_MIM_SERVER";
/// Comma-separated function names to intercept in-process.
pub const FUNCTION_INTERCEPTS_ENV: &str = "TEXTTEST_MIM_PYTHON";
/// Comma-separated caller names whose calls pass through unintercepted.
pub const FUNCTION_IGNORE_ENV: &str = "TEXTTEST_MIM_PYTHON_IGNORE";

/// Prefix marking a function result that is a raised error rather than a value.
pub const RAISE_PREFIX: &str = "raise ";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// A subprocess invocation captured by the shim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLineEnvelope {
    pub argv: Vec<String>,
    pub environ: BTreeMap<String, String>,
    pub cwd: String,
    pub pid: u32,
}

impl CommandLineEnvelope {
    pub fn encode(&self) -> String {
        [
            format!("{}:{}", COMMAND_LINE_PREFIX, repr::render_list(&self.argv)),
            repr::render_dict(&self.environ),
            self.cwd.clone(),
            self.pid.to_string(),
        ]
        .join(SUT_SEP)
    }

    fn parse_body(body: &str) -> Result<Self, ErrorInfo> {
        let fields: Vec<&str> = body.split(SUT_SEP).collect();
        let [argv, environ, cwd, pid] = fields.as_slice() else {
            return Err(ErrorInfo::new(
                "invalid_envelope",
                format!(
                    "command line envelope needs 4 fields, found {}",
                    fields.len()
                ),
            ));
        };
        let argv = repr::parse_list(argv)?;
        if argv.is_empty() {
            return Err(ErrorInfo::new("invalid_envelope", "argv is empty"));
        }
        Ok(Self {
            argv,
            environ: repr::parse_dict(environ)?,
            cwd: cwd.to_string(),
            pid: parse_pid(pid)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandKillEnvelope {
    pub signal: i32,
    pub pid: u32,
}

impl CommandKillEnvelope {
    pub fn encode(&self) -> String {
        format!(
            "{}:{}{}{}",
            COMMAND_KILL_PREFIX, self.signal, SUT_SEP, self.pid
        )
    }

    fn parse_body(body: &str) -> Result<Self, ErrorInfo> {
        let (signal, pid) = body.split_once(SUT_SEP).ok_or_else(|| {
            ErrorInfo::new("invalid_envelope", "kill envelope needs signal and pid")
        })?;
        let signal = signal.trim().parse::<i32>().map_err(|err| {
            ErrorInfo::new(
                "invalid_envelope",
                format!("invalid signal {:?}: {}", signal, err),
            )
        })?;
        Ok(Self {
            signal,
            pid: parse_pid(pid)?,
        })
    }
}

/// An in-process call routed through the shim's function wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCallEnvelope {
    pub function: String,
    /// JSON array text of the call arguments.
    pub args: String,
}

impl FunctionCallEnvelope {
    pub fn encode(&self) -> String {
        format!(
            "{}:{}{}{}",
            FUNCTION_CALL_PREFIX, self.function, SUT_SEP, self.args
        )
    }

    fn parse_body(body: &str) -> Result<Self, ErrorInfo> {
        let (function, args) = body.split_once(SUT_SEP).ok_or_else(|| {
            ErrorInfo::new(
                "invalid_envelope",
                "function call envelope needs function and arguments",
            )
        })?;
        if function.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_envelope", "function name is empty"));
        }
        serde_json::from_str::<serde_json::Value>(args).map_err(|err| {
            ErrorInfo::new(
                "invalid_envelope",
                format!("function arguments are not valid JSON: {}", err),
            )
        })?;
        Ok(Self {
            function: function.trim().to_string(),
            args: args.to_string(),
        })
    }
}

/// Everything the server can receive on one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    CommandLine(CommandLineEnvelope),
    CommandKill(CommandKillEnvelope),
    ServerState(String),
    FunctionCall(FunctionCallEnvelope),
    Terminate,
    /// Anything without a recognised prefix is plain socket traffic.
    Raw(String),
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, ErrorInfo> {
        if text.starts_with(TERMINATE_MESSAGE) {
            return Ok(Envelope::Terminate);
        }
        if let Some(body) = strip_prefix(text, COMMAND_LINE_PREFIX) {
            return CommandLineEnvelope::parse_body(body).map(Envelope::CommandLine);
        }
        if let Some(body) = strip_prefix(text, COMMAND_KILL_PREFIX) {
            return CommandKillEnvelope::parse_body(body).map(Envelope::CommandKill);
        }
        if let Some(body) = strip_prefix(text, FUNCTION_CALL_PREFIX) {
            return FunctionCallEnvelope::parse_body(body).map(Envelope::FunctionCall);
        }
        if let Some(body) = strip_prefix(text, SERVER_STATE_PREFIX) {
            let state = body.strip_suffix('\n').unwrap_or(body);
            return Ok(Envelope::ServerState(state.to_string()));
        }
        Ok(Envelope::Raw(text.to_string()))
    }

    pub fn encode(&self) -> String {
        match self {
            Envelope::CommandLine(envelope) => envelope.encode(),
            Envelope::CommandKill(envelope) => envelope.encode(),
            Envelope::ServerState(state) => format!("{}:{}\n", SERVER_STATE_PREFIX, state),
            Envelope::FunctionCall(envelope) => envelope.encode(),
            Envelope::Terminate => format!("{}\n", TERMINATE_MESSAGE),
            Envelope::Raw(text) => text.clone(),
        }
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::CommandLine(_) => "command_line",
            Envelope::CommandKill(_) => "command_kill",
            Envelope::ServerState(_) => "server_state",
            Envelope::FunctionCall(_) => "function_call",
            Envelope::Terminate => "terminate",
            Envelope::Raw(_) => "raw",
        }
    }
}

/// The `stdout|TT_CMD_SEP|stderr|TT_CMD_SEP|exit_code` reply to a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandReply {
    pub fn encode(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.stdout, CMD_SEP, self.stderr, CMD_SEP, self.exit_code
        )
    }

    pub fn parse(text: &str) -> Result<Self, ErrorInfo> {
        let parts: Vec<&str> = text.split(CMD_SEP).collect();
        let [stdout, stderr, exit_code] = parts.as_slice() else {
            return Err(ErrorInfo::new(
                "invalid_reply",
                format!("expected 3 reply fields, found {}", parts.len()),
            ));
        };
        let exit_code = exit_code.trim().parse::<i32>().map_err(|err| {
            ErrorInfo::new(
                "invalid_reply",
                format!("invalid exit code {:?}: {}", exit_code, err),
            )
        })?;
        Ok(Self {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
        })
    }

    /// Error-shaped triple used when a request could not be served at all.
    pub fn failure(message: impl Into<String>) -> Self {
        let mut stderr = message.into();
        if !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        Self {
            stdout: String::new(),
            stderr,
            exit_code: 1,
        }
    }

    /// The signal that killed the simulated process, if any.
    ///
    /// Negative codes carry the signal directly; codes in `129..=160` follow
    /// the shell's `128 + signal` convention.
    pub fn killed_by_signal(&self) -> Option<i32> {
        if self.exit_code < 0 {
            Some(-self.exit_code)
        } else if self.exit_code > 128 && self.exit_code <= 160 {
            Some(self.exit_code - 128)
        } else {
            None
        }
    }
}

fn strip_prefix<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    text.strip_prefix(prefix)?.strip_prefix(':')
}

fn parse_pid(text: &str) -> Result<u32, ErrorInfo> {
    match text.trim().parse::<u32>() {
        Ok(0) | Err(_) => Err(ErrorInfo::new(
            "invalid_pid",
            format!("invalid pid {:?}", text),
        )),
        Ok(pid) => Ok(pid),
    }
}
