//! Running the real command behind an intercepted command line.

use crate::error::{MockError, Result};
use capturemock_protocol::{CommandKillEnvelope, CommandLineEnvelope, CommandReply};
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Kill requests that arrive while a real command is running.
pub trait KillSource {
    /// Kill envelopes received since the last poll.
    fn poll_kills(&mut self) -> Vec<CommandKillEnvelope>;
}

/// A kill source that never delivers anything.
pub struct NoKills;

impl KillSource for NoKills {
    fn poll_kills(&mut self) -> Vec<CommandKillEnvelope> {
        Vec::new()
    }
}

/// Runs `program` with the envelope's arguments, environment and working
/// directory, capturing stdout and stderr. Kill envelopes addressed to the
/// envelope's pid are delivered to the child while it runs. A child killed
/// by a signal reports the negated signal as its exit code.
pub fn run(
    envelope: &CommandLineEnvelope,
    program: &str,
    kills: &mut dyn KillSource,
) -> Result<CommandReply> {
    let mut command = Command::new(program);
    command
        .args(envelope.argv.iter().skip(1))
        .env_clear()
        .envs(&envelope.environ)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if !envelope.cwd.is_empty() {
        command.current_dir(&envelope.cwd);
    }

    let mut child = command.spawn().map_err(|source| MockError::CommandSpawn {
        command: program.to_string(),
        source,
    })?;
    tracing::debug!(program, pid = child.id(), "Started real command");

    let stdout = capture(child.stdout.take());
    let stderr = capture(child.stderr.take());

    let status = wait_with_kills(&mut child, envelope.pid, kills)?;

    Ok(CommandReply {
        stdout: join_capture(stdout),
        stderr: join_capture(stderr),
        exit_code: exit_code(status),
    })
}

fn capture<R: Read + Send + 'static>(stream: Option<R>) -> Option<thread::JoinHandle<Vec<u8>>> {
    stream.map(|mut stream| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            if let Err(err) = stream.read_to_end(&mut buffer) {
                tracing::warn!(error = %err, "Failed to read command output");
            }
            buffer
        })
    })
}

fn join_capture(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn wait_with_kills(child: &mut Child, proxy_pid: u32, kills: &mut dyn KillSource) -> Result<ExitStatus> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(err) => return Err(MockError::io("Failed to wait for command", err)),
        }

        for kill in kills.poll_kills() {
            if kill.pid != proxy_pid {
                tracing::debug!(
                    pid = kill.pid,
                    running_for = proxy_pid,
                    "Kill addressed to another process; ignoring"
                );
                continue;
            }
            deliver_signal(child, kill.signal);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn deliver_signal(child: &Child, signal: i32) {
    tracing::info!(pid = child.id(), signal, "Forwarding signal to real command");
    // SAFETY: kill(2) with a pid we spawned and have not yet reaped.
    let result = unsafe { libc::kill(child.id() as libc::pid_t, signal) };
    if result != 0 {
        tracing::warn!(
            error = %std::io::Error::last_os_error(),
            "Failed to signal real command"
        );
    }
}

#[cfg(not(unix))]
fn deliver_signal(child: &mut Child, signal: i32) {
    tracing::info!(pid = child.id(), signal, "Terminating real command");
    if let Err(err) = child.kill() {
        tracing::warn!(error = %err, "Failed to terminate real command");
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => 1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
