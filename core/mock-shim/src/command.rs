//! Command-line interception.
//!
//! The shim sends `SUT_COMMAND_LINE:<argv>:SUT_SEP:<environ>:SUT_SEP:<cwd>:SUT_SEP:<pid>`
//! to the server, half-closes, and waits for the
//! `stdout|TT_CMD_SEP|stderr|TT_CMD_SEP|exit` reply.

use crate::platform::{self, KillWatcher};
use crate::{Result, ShimError};
use capturemock_core::transport::read_reply;
use capturemock_core::Transport;
use capturemock_protocol::{CommandLineEnvelope, CommandReply, SERVER_ENV};
use std::collections::BTreeMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Intercepts `argv` and reproduces the server's reply. Returns the exit
/// code, or does not return when the command was killed by a signal.
///
/// `shim_dir` is removed from the forwarded `PATH`; it is only known when the
/// shim runs through an installed link.
pub fn run(argv: Vec<String>, shim_dir: Option<PathBuf>) -> i32 {
    platform::install_handlers();
    let outcome = server_address()
        .and_then(|address| intercept(&address, argv, shim_dir.as_deref()));
    match outcome {
        Ok(reply) => reproduce(&reply),
        Err(err) => {
            tracing::error!(error = %err, "Command interception failed");
            let _ = writeln!(std::io::stderr(), "{}", err);
            1
        }
    }
}

pub fn server_address() -> Result<String> {
    env::var(SERVER_ENV)
        .ok()
        .filter(|address| !address.trim().is_empty())
        .ok_or(ShimError::MissingServerAddress)
}

/// Sends the command line to the server at `address` and returns its reply.
pub fn intercept(
    address: &str,
    argv: Vec<String>,
    shim_dir: Option<&Path>,
) -> Result<CommandReply> {
    let cwd = env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_default();
    let envelope = command_envelope(
        argv,
        env::vars_os(),
        shim_dir,
        cwd,
        std::process::id(),
    );
    tracing::debug!(argv = ?envelope.argv, address, "Intercepted command");

    let transport = Transport::new(address);
    let mut stream = transport.submit(&envelope.encode())?;
    let watcher = KillWatcher::spawn(transport, envelope.pid);
    let reply = read_reply(&mut stream).map_err(ShimError::ReplyRead);
    drop(watcher);
    parse_reply(&reply?)
}

pub fn parse_reply(text: &str) -> Result<CommandReply> {
    CommandReply::parse(text).map_err(|err| {
        tracing::warn!(error = %err, "Unparsable reply");
        ShimError::MalformedReply(text.to_string())
    })
}

/// Builds the envelope for `argv`, removing the shim's own directory from
/// the forwarded `PATH` so the server does not find the shim again.
pub fn command_envelope<I>(
    argv: Vec<String>,
    environ: I,
    shim_dir: Option<&Path>,
    cwd: String,
    pid: u32,
) -> CommandLineEnvelope
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut environ: BTreeMap<String, String> = environ
        .into_iter()
        .map(|(key, value)| {
            (
                key.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )
        })
        .collect();
    if let (Some(dir), Some(path)) = (shim_dir, environ.get_mut("PATH")) {
        *path = filter_path(path, dir);
    }

    CommandLineEnvelope {
        argv: command_line(argv),
        environ,
        cwd,
        pid,
    }
}

/// `PATH` with every entry equal to `dir` removed.
pub fn filter_path(path: &str, dir: &Path) -> String {
    let kept: Vec<PathBuf> = env::split_paths(path)
        .filter(|entry| entry.as_path() != dir)
        .collect();
    env::join_paths(kept)
        .map(|joined| joined.to_string_lossy().into_owned())
        .unwrap_or_else(|_| path.to_string())
}

/// The directory of the intercept link the shim was run as: the directory
/// part of `program`, or the first `PATH` entry holding a file of that name.
pub fn link_dir(program: &str) -> Option<PathBuf> {
    let program = Path::new(program);
    if let Some(parent) = program.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        return Some(parent.to_path_buf());
    }
    search_path(program, &env::var_os("PATH")?)
}

fn search_path(program: &Path, path: &OsStr) -> Option<PathBuf> {
    env::split_paths(path).find(|dir| dir.join(program).exists())
}

#[cfg(unix)]
fn command_line(argv: Vec<String>) -> Vec<String> {
    argv
}

#[cfg(not(unix))]
fn command_line(mut argv: Vec<String>) -> Vec<String> {
    if let Some(program) = argv.first_mut() {
        if let Some(stem) = Path::new(program.as_str()).file_stem() {
            *program = stem.to_string_lossy().into_owned();
        }
    }
    argv
}

fn reproduce(reply: &CommandReply) -> i32 {
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(reply.stdout.as_bytes());
    let _ = stdout.flush();
    let mut stderr = std::io::stderr();
    let _ = stderr.write_all(reply.stderr.as_bytes());
    let _ = stderr.flush();

    if let Some(signal) = reply.killed_by_signal() {
        platform::die_by_signal(signal);
    }
    reply.exit_code
}
