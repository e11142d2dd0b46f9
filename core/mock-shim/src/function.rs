//! In-process function call interception.
//!
//! A call to an intercepted function is sent to the server as
//! `SUT_FUNCTION_CALL:<function>:SUT_SEP:<json args>`; the reply is the JSON
//! return value, or `raise <error>` when the call failed. Calls that are not
//! intercepted, or that come from an ignored caller, run the real function.

use crate::ShimError;
use capturemock_core::Transport;
use capturemock_protocol::{
    FunctionCallEnvelope, FUNCTION_IGNORE_ENV, FUNCTION_INTERCEPTS_ENV, RAISE_PREFIX, SERVER_ENV,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::env;

#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    /// The call raised on the recorded side; carries the error text.
    #[error("{0}")]
    Raised(String),

    #[error(transparent)]
    Shim(#[from] ShimError),
}

#[derive(Debug, Clone, Default)]
pub struct FunctionInterceptor {
    transport: Option<Transport>,
    intercepts: Vec<String>,
    ignored_callers: Vec<String>,
}

impl FunctionInterceptor {
    pub fn new(address: Option<String>, intercepts: Vec<String>, ignored_callers: Vec<String>) -> Self {
        Self {
            transport: address.map(Transport::new),
            intercepts,
            ignored_callers,
        }
    }

    /// Reads the server address, intercepted names and ignored callers from
    /// the environment. Without a server address nothing is intercepted.
    pub fn from_env() -> Self {
        let address = env::var(SERVER_ENV)
            .ok()
            .filter(|address| !address.trim().is_empty());
        Self::new(
            address,
            env_list(FUNCTION_INTERCEPTS_ENV),
            env_list(FUNCTION_IGNORE_ENV),
        )
    }

    pub fn is_intercepted(&self, function: &str, caller: Option<&str>) -> bool {
        if self.transport.is_none() || !matches_any(&self.intercepts, function) {
            return false;
        }
        !caller.is_some_and(|caller| matches_any(&self.ignored_callers, caller))
    }

    /// Calls `function` through the server when intercepted, otherwise runs
    /// `real`.
    pub fn call<A, T, F>(
        &self,
        function: &str,
        caller: Option<&str>,
        args: &A,
        real: F,
    ) -> Result<T, InterceptError>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
        F: FnOnce() -> T,
    {
        let Some(transport) = self
            .transport
            .as_ref()
            .filter(|_| self.is_intercepted(function, caller))
        else {
            return Ok(real());
        };

        let args = match serde_json::to_value(args).map_err(ShimError::from)? {
            Value::Array(items) => Value::Array(items),
            other => Value::Array(vec![other]),
        };
        let envelope = FunctionCallEnvelope {
            function: function.to_string(),
            args: args.to_string(),
        };
        tracing::debug!(function, "Intercepted function call");

        let reply = transport.request(&envelope.encode()).map_err(ShimError::from)?;
        decode_return(&reply)
    }
}

/// Interprets the server's reply to a function call.
pub fn decode_return<T: DeserializeOwned>(reply: &str) -> Result<T, InterceptError> {
    if let Some(error) = reply.strip_prefix(RAISE_PREFIX) {
        return Err(InterceptError::Raised(error.to_string()));
    }
    serde_json::from_str(reply).map_err(|_| ShimError::MalformedReply(reply.to_string()).into())
}

fn env_list(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Exact match, or `name` lies inside a dotted item (`os` covers `os.getenv`).
fn matches_any(items: &[String], name: &str) -> bool {
    items.iter().any(|item| {
        name == item
            || name
                .strip_prefix(item.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    })
}
