//! Server-side handlers standing in for the real destination of intercepted
//! function calls.

use capturemock_protocol::RAISE_PREFIX;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub type FunctionHandler = Box<dyn Fn(&[Value]) -> std::result::Result<Value, String> + Send>;

#[derive(Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, FunctionHandler>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with handlers for the common sources of non-determinism.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("time.time", |_| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|err| format!("ClockError({:?})", err.to_string()))?;
            Ok(Value::from(now.as_secs_f64()))
        });
        registry.register("os.getcwd", |_| {
            std::env::current_dir()
                .map(|dir| Value::from(dir.display().to_string()))
                .map_err(|err| format!("OSError({:?})", err.to_string()))
        });
        registry.register("os.getenv", |args| {
            let name = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| "TypeError('getenv expects a variable name')".to_string())?;
            Ok(std::env::var(name)
                .map(Value::from)
                .unwrap_or_else(|_| args.get(1).cloned().unwrap_or(Value::Null)))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&[Value]) -> std::result::Result<Value, String> + Send + 'static,
    {
        self.handlers.insert(name.to_string(), Box::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Calls `name` with the JSON array `args`. The result is JSON text, or
    /// `raise <error>` when the call failed.
    pub fn call(&self, name: &str, args: &str) -> String {
        let Some(handler) = self.handlers.get(name) else {
            return format!("{}NotRegistered({:?})", RAISE_PREFIX, name);
        };
        let args = match serde_json::from_str::<Value>(args) {
            Ok(Value::Array(args)) => args,
            Ok(other) => vec![other],
            Err(err) => {
                return format!("{}TypeError({:?})", RAISE_PREFIX, err.to_string());
            }
        };
        match handler(&args) {
            Ok(value) => value.to_string(),
            Err(error) => format!("{}{}", RAISE_PREFIX, error),
        }
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("handlers", &names)
            .finish()
    }
}
