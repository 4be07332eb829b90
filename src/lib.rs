//! pybridge - call functions of a worker process as blocking Rust calls.
//!
//! A worker file (by default a Python script) is spawned with a port
//! argument, binds a WebSocket listener on it and answers four JSON
//! messages: `list` / `list` (discovery) and `call` / `result`. The host
//! connects with backoff, discovers the worker's functions and then calls
//! them synchronously: each call blocks until the result carrying its
//! correlation id arrives.
//!
//! # Example
//!
//! ```rust,no_run
//! use pybridge::{call, Bridge, BridgeOptions};
//!
//! let bridge = Bridge::setup(None, BridgeOptions::from_env())?;
//! let module = bridge.load("worker.py")?;
//! module.start(None)?;
//!
//! let sum = call!(module, add(2, 3))?;
//! assert_eq!(sum, 5);
//!
//! let echoed: String = module.call_as("echo", vec!["hi".into()])?;
//! assert_eq!(echoed, "hi");
//!
//! module.stop();
//! # Ok::<(), pybridge::BridgeError>(())
//! ```
//!
//! # Worker contract
//!
//! The worker is started as
//! `<interpreter> [interpreter args] <file> --pyjs-port <port>` and must
//! accept an unauthenticated WebSocket connection on `127.0.0.1:<port>`.

mod bridge;
mod channel;
mod config;
mod connect;
mod error;
mod logging;
mod message;
mod metrics;
mod module;
mod registry;
mod supervisor;
pub mod call_macro;

#[cfg(test)]
mod test_utils;

pub use bridge::{Bridge, DEFAULT_LOG_FILE};
pub use call_macro::{CallArgs, ToJsonArg};
pub use config::{BridgeOptions, ModuleBuilder, DEFAULT_PORT_FLAG, INTERPRETER_ENV};
pub use connect::Backoff;
pub use error::{BridgeError, Result};
pub use logging::{
    default_json_handler, default_pretty_handler, AppendLog, LogEntry, LogEvent, LogHandler,
    LogLevel, LogOptions, StructuredLogger,
};
pub use message::{Message, MessageType};
pub use metrics::MetricsSnapshot;
pub use module::{FunctionProxy, ModuleHandle, ModuleState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Load a worker file with options from the environment and no log file.
///
/// Nothing is spawned until [`ModuleHandle::start`].
pub fn load(file: impl AsRef<std::path::Path>) -> Result<ModuleHandle> {
    ModuleHandle::with_options(file, BridgeOptions::from_env())
}
