//! File logging for the shim.
//!
//! The shim shares stdout and stderr with the system under test, so it logs
//! nowhere unless `CAPTUREMOCK_LOG_DIR` names a directory. Then a daily
//! rolling `capturemock-shim.log` is written there through a non-blocking
//! writer. Its guard is held here until [`flush`], which every exit path
//! calls, including death by signal.

use std::env;
use std::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const LOG_DIR_ENV: &str = "CAPTUREMOCK_LOG_DIR";
pub const DEBUG_ENV: &str = "CAPTUREMOCK_DEBUG_LOG";
const LOG_FILE_NAME: &str = "capturemock-shim.log";

static GUARD: Mutex<Option<WorkerGuard>> = Mutex::new(None);

/// Installs the file subscriber when configured. Returns whether file
/// logging is active.
pub fn init() -> bool {
    match subscriber() {
        Some(guard) => {
            if let Ok(mut slot) = GUARD.lock() {
                *slot = Some(guard);
            }
            true
        }
        None => false,
    }
}

/// Writes out pending log lines. Nothing is logged to the file afterwards.
pub fn flush() {
    let guard = GUARD.lock().ok().and_then(|mut slot| slot.take());
    drop(guard);
}

fn subscriber() -> Option<WorkerGuard> {
    let dir = env::var_os(LOG_DIR_ENV).filter(|dir| !dir.is_empty())?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let debug_enabled = env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
