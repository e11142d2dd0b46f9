//! # capturemock-core
//!
//! Record/replay engine for CaptureMock, shared by the mock server and its
//! client shim.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. The server is a single-threaded loop
//!   and the engine handles one request at a time.
//! - **Exact matching**: Live requests match script blocks only by equal
//!   [`Fingerprint`]s; normalization rules live in [`fingerprint`].
//! - **Write-through recording**: Each recorded block is flushed before its
//!   response is sent.
//! - **Errors never cross the server loop**: [`Engine::process`] always
//!   produces responses; failures are logged.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use capturemock_core::{Engine, Mode, RcConfig, RecordLog, NoKills, Request};
//!
//! let config = RcConfig::load(&[])?;
//! let blocks = capturemock_core::script::load(replay_path)?;
//! let mut engine = Engine::new(config, Mode::ReplayOnly, blocks, RecordLog::disabled())?;
//! let responses = engine.process(&request, 1, &mut NoKills);
//! ```

pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod functions;
pub mod patterns;
pub mod record;
pub mod replay;
pub mod script;
pub mod traffic;
pub mod transport;

pub use command::{KillSource, NoKills};
pub use config::{Mode, RcConfig, COMMAND_LINE_SECTION, FUNCTIONS_SECTION, GENERAL_SECTION};
pub use engine::{Alteration, Engine};
pub use error::{MockError, Result};
pub use fingerprint::{Fingerprint, Normalizer};
pub use functions::FunctionRegistry;
pub use record::RecordLog;
pub use replay::ReplayState;
pub use script::{ReplayItems, RequestBlock, ScriptWriter};
pub use traffic::{Direction, Request, RequestTag, Response, ResponseKind, ResponseSink};
pub use transport::{connect_ex, RetryPolicy, Transport};
