//! Error types for capturemock-core operations.

use capturemock_protocol::ErrorInfo;
use std::path::PathBuf;

/// All errors that can occur while configuring, loading scripts, talking to
/// peers or running the engine.
#[derive(Debug, thiserror::Error)]
pub enum MockError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}:{line}: {details}")]
    ConfigMalformed {
        path: PathBuf,
        line: usize,
        details: String,
    },

    #[error("Configuration option {option} in [{section}] is invalid: {details}")]
    ConfigInvalidOption {
        section: String,
        option: String,
        details: String,
    },

    #[error("Required configuration option missing: {0}")]
    ConfigMissingOption(String),

    #[error("Unknown mode {0:?} (expected replay, record or mixed)")]
    InvalidMode(String),

    // ─────────────────────────────────────────────────────────────────────
    // Script Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Script malformed: {path}:{line}: {details}")]
    ScriptMalformed {
        path: PathBuf,
        line: usize,
        details: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Traffic Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid envelope: {0}")]
    Envelope(#[from] ErrorInfo),

    #[error("Transport to {address} failed after {attempts} attempt(s): {source}")]
    Transport {
        address: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Command could not be started: {command}: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl MockError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        MockError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using MockError.
pub type Result<T> = std::result::Result<T, MockError>;

impl From<MockError> for String {
    fn from(err: MockError) -> String {
        err.to_string()
    }
}
