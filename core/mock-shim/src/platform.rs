//! Signal handling for intercepted commands.
//!
//! SIGINT and SIGTERM received by the shim are remembered rather than acted
//! on. Once the command line has been sent, a [`KillWatcher`] forwards each
//! of them to the server so the real command (if any) receives it too. When
//! the reply says the command died by a signal, the shim dies the same way.

use capturemock_core::{RetryPolicy, Transport};
use capturemock_protocol::CommandKillEnvelope;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const WATCH_INTERVAL: Duration = Duration::from_millis(20);

static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);
static SIGNAL_COUNT: AtomicUsize = AtomicUsize::new(0);

/// The most recent SIGINT/SIGTERM received, if any.
pub fn received_signal() -> Option<i32> {
    match LAST_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        signal => Some(signal),
    }
}

fn note_signal(signal: i32) {
    LAST_SIGNAL.store(signal, Ordering::SeqCst);
    SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst);
}

#[cfg(unix)]
extern "C" fn handle_signal(signal: libc::c_int) {
    note_signal(signal);
}

/// Starts remembering SIGINT and SIGTERM instead of dying on them.
#[cfg(unix)]
pub fn install_handlers() {
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only touches atomics.
        let previous = unsafe { libc::signal(signal, handle_signal as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            tracing::warn!(signal, "Failed to install signal handler");
        }
    }
}

#[cfg(not(unix))]
pub fn install_handlers() {}

/// Terminates the process the way the real command terminated.
///
/// On unix the default dispositions are restored and the signal the shim
/// itself received is raised again. Without one the shim waits to be
/// killed, as the real command was.
#[cfg(unix)]
pub fn die_by_signal(reply_signal: i32) -> ! {
    tracing::info!(reply_signal, received = ?received_signal(), "Command was killed");
    crate::logging::flush();
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: restoring the default disposition.
        unsafe {
            libc::signal(signal, libc::SIG_DFL);
        }
    }
    if let Some(signal) = received_signal() {
        // SAFETY: raise(3) on our own process.
        unsafe {
            libc::raise(signal);
        }
        std::process::exit(128 + signal);
    }
    loop {
        // SAFETY: pause(2) only returns after a caught signal.
        unsafe {
            libc::pause();
        }
    }
}

#[cfg(not(unix))]
pub fn die_by_signal(reply_signal: i32) -> ! {
    tracing::info!(reply_signal, "Command was killed");
    crate::logging::flush();
    std::process::exit(128 + reply_signal)
}

/// Forwards received signals to the server as kill envelopes until dropped.
pub struct KillWatcher {
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KillWatcher {
    pub fn spawn(transport: Transport, pid: u32) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        let transport = transport.with_policy(RetryPolicy::once());
        let handle = thread::spawn(move || {
            let mut forwarded = 0;
            while !flag.load(Ordering::SeqCst) {
                let count = SIGNAL_COUNT.load(Ordering::SeqCst);
                if count > forwarded {
                    forwarded = count;
                    if let Some(signal) = received_signal() {
                        forward_kill(&transport, signal, pid);
                    }
                }
                thread::sleep(WATCH_INTERVAL);
            }
        });
        Self {
            done,
            handle: Some(handle),
        }
    }
}

impl Drop for KillWatcher {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn forward_kill(transport: &Transport, signal: i32, pid: u32) {
    let envelope = CommandKillEnvelope { signal, pid };
    match transport.send(&envelope.encode()) {
        Ok(()) => tracing::debug!(signal, pid, "Forwarded kill to mock server"),
        Err(err) => tracing::warn!(error = %err, signal, "Failed to forward kill"),
    }
}
