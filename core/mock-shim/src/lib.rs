//! # capturemock-shim
//!
//! The client side of CaptureMock. Installed in front of a program (a
//! symlink named after it, placed first on `PATH`) the shim forwards the
//! invocation to the mock server and reproduces the reply: stdout, stderr,
//! exit code, or death by signal. The same crate wraps in-process function
//! calls via [`FunctionInterceptor`].
//!
//! The shim must never add output of its own to what the system under test
//! sees. Diagnostics only go to a log file, and only when
//! `CAPTUREMOCK_LOG_DIR` is set (see [`logging`]).

use capturemock_core::MockError;
use std::path::PathBuf;

pub mod command;
pub mod function;
pub mod install;
pub mod logging;
pub mod platform;

pub use function::{FunctionInterceptor, InterceptError};

#[derive(Debug, thiserror::Error)]
pub enum ShimError {
    #[error("TEXTTEST_MIM_SERVER is not set; cannot contact the mock server")]
    MissingServerAddress,

    #[error("Could not contact mock server: {0}")]
    Transport(#[from] MockError),

    #[error("Could not read reply from mock server: {0}")]
    ReplyRead(#[source] std::io::Error),

    #[error("Received unexpected communication from mock server:\n {0}\n")]
    MalformedReply(String),

    #[error("Failed to serialize call data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to install intercept at {path}: {source}")]
    Install {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ShimError>;
