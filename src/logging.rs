//! Structured logging for module lifecycle events.
//!
//! Entries go to a pluggable handler. [`AppendLog`] is the human-readable
//! sink: one timestamped line per event, appended and never read back.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Log levels for structured logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Bridge lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    BridgeSetup,

    // Process
    ProcessSpawn,
    ProcessOutput,
    ProcessExit,

    // Connection
    ConnectAttempt,
    ConnectFailed,
    SocketConnect,
    SocketDisconnect,

    // Discovery
    DiscoveryComplete,

    // Requests
    RequestStart,
    RequestEnd,
    RequestError,

    // Protocol
    ProtocolViolation,
    UnmatchedResult,

    WorkerStop,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// Structured log entry with all context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogEntry {
    pub event: String,
    pub level: String,
    pub message: String,
    pub timestamp: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub type LogHandler = Arc<dyn Fn(&LogEntry) + Send + Sync>;

/// Options for log entries.
#[derive(Default)]
pub struct LogOptions {
    pub port: Option<u16>,
    pub request_id: Option<String>,
    pub function: Option<String>,
    pub duration_ms: Option<f64>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Structured logger with a pluggable handler.
///
/// Cloning is cheap; a module handle clones the bridge logger and pins
/// its own worker file as context.
///
/// ```rust
/// use pybridge::{LogEntry, LogEvent, LogLevel, LogOptions, StructuredLogger};
/// use std::sync::Arc;
///
/// let logger = StructuredLogger::new(
///     Some(Arc::new(|entry: &LogEntry| println!("{}", entry.to_json()))),
///     LogLevel::Info,
/// );
/// logger.info(LogEvent::BridgeSetup, "Started pyjs.", LogOptions::default());
/// ```
#[derive(Clone)]
pub struct StructuredLogger {
    handler: Option<LogHandler>,
    level: LogLevel,
    module: Option<String>,
}

impl fmt::Debug for StructuredLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructuredLogger")
            .field("enabled", &self.handler.is_some())
            .field("level", &self.level)
            .field("module", &self.module)
            .finish()
    }
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl StructuredLogger {
    pub fn new(handler: Option<LogHandler>, level: LogLevel) -> Self {
        Self {
            handler,
            level,
            module: None,
        }
    }

    /// Logger that drops every entry.
    pub fn disabled() -> Self {
        Self::new(None, LogLevel::Info)
    }

    pub fn set_handler(&mut self, handler: LogHandler) {
        self.handler = Some(handler);
    }

    /// Send entries to `handler` as well as to any handler already set.
    pub fn add_handler(&mut self, handler: LogHandler) {
        let combined: LogHandler = match self.handler.take() {
            Some(existing) => Arc::new(move |entry: &LogEntry| {
                existing(entry);
                handler(entry);
            }),
            None => handler,
        };
        self.handler = Some(combined);
    }

    /// Copy of this logger tagged with a worker file.
    pub fn for_module(&self, module: &Path) -> Self {
        Self {
            module: Some(module.display().to_string()),
            ..self.clone()
        }
    }

    fn should_log(&self, level: LogLevel) -> bool {
        level as u8 >= self.level as u8
    }

    pub fn log(&self, event: LogEvent, message: &str, level: LogLevel, options: LogOptions) {
        let Some(ref handler) = self.handler else {
            return;
        };
        if !self.should_log(level) {
            return;
        }

        let entry = LogEntry {
            event: event.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            timestamp: current_timestamp(),
            module: self.module.clone(),
            port: options.port,
            request_id: options.request_id,
            function: options.function,
            duration_ms: options.duration_ms,
            success: options.success,
            error: options.error,
            metadata: options.metadata,
        };

        handler(&entry);
    }

    pub fn debug(&self, event: LogEvent, message: &str, options: LogOptions) {
        self.log(event, message, LogLevel::Debug, options);
    }

    pub fn info(&self, event: LogEvent, message: &str, options: LogOptions) {
        self.log(event, message, LogLevel::Info, options);
    }

    pub fn warn(&self, event: LogEvent, message: &str, options: LogOptions) {
        self.log(event, message, LogLevel::Warn, options);
    }

    pub fn error(&self, event: LogEvent, message: &str, options: LogOptions) {
        self.log(event, message, LogLevel::Error, options);
    }

    // Convenience methods for lifecycle events

    pub fn bridge_setup(&self) {
        self.info(LogEvent::BridgeSetup, "Started pyjs.", LogOptions::default());
    }

    pub fn process_spawn(&self, port: u16, caller_chosen: bool) {
        let target = self.module.as_deref().unwrap_or("<unknown>");
        self.info(
            LogEvent::ProcessSpawn,
            &format!(
                "Loading {} on port={} ({}).",
                target,
                port,
                if caller_chosen { "user-chosen" } else { "random" }
            ),
            LogOptions {
                port: Some(port),
                ..Default::default()
            },
        );
    }

    /// Forward a chunk of worker output unparsed.
    pub fn process_output(&self, level: LogLevel, chunk: &str) {
        self.log(LogEvent::ProcessOutput, chunk, level, LogOptions::default());
    }

    pub fn process_exit(&self, exit_code: Option<i32>) {
        let level = if exit_code == Some(0) {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        self.log(
            LogEvent::ProcessExit,
            &format!("Worker process exited ({})", code),
            level,
            LogOptions {
                metadata: Some(serde_json::json!({ "exit_code": exit_code })),
                ..Default::default()
            },
        );
    }

    pub fn connect_attempt(&self, port: u16, delay_ms: u128) {
        self.info(
            LogEvent::ConnectAttempt,
            &format!("Attempting to connect to ws://127.0.0.1:{} (delay = {}ms)", port, delay_ms),
            LogOptions {
                port: Some(port),
                ..Default::default()
            },
        );
    }

    pub fn connect_failed(&self, port: u16, reason: &str) {
        self.info(
            LogEvent::ConnectFailed,
            &format!("Failed to connect to ws://127.0.0.1:{}.", port),
            LogOptions {
                port: Some(port),
                error: Some(reason.to_string()),
                ..Default::default()
            },
        );
    }

    pub fn socket_connect(&self, port: u16) {
        self.info(
            LogEvent::SocketConnect,
            &format!("WS connection made to ws://127.0.0.1:{}", port),
            LogOptions {
                port: Some(port),
                ..Default::default()
            },
        );
    }

    pub fn socket_disconnect(&self, reason: &str) {
        self.info(
            LogEvent::SocketDisconnect,
            &format!("WS connection closed: {}", reason),
            LogOptions::default(),
        );
    }

    pub fn discovery_complete(&self, funcs: &[String]) {
        self.info(
            LogEvent::DiscoveryComplete,
            &format!("Discovered {} function(s): {}", funcs.len(), funcs.join(", ")),
            LogOptions {
                metadata: Some(serde_json::json!({ "funcs": funcs })),
                ..Default::default()
            },
        );
    }

    pub fn request_start(&self, request_id: &str, function: &str, args: &[serde_json::Value]) {
        let rendered = serde_json::to_string(args).unwrap_or_default();
        self.info(
            LogEvent::RequestStart,
            &format!("Calling {}({}) [id={}]", function, rendered, request_id),
            LogOptions {
                request_id: Some(request_id.to_string()),
                function: Some(function.to_string()),
                ..Default::default()
            },
        );
    }

    pub fn request_end(
        &self,
        request_id: &str,
        function: &str,
        duration_ms: f64,
        error: Option<String>,
    ) {
        let success = error.is_none();
        let (event, level) = if success {
            (LogEvent::RequestEnd, LogLevel::Debug)
        } else {
            (LogEvent::RequestError, LogLevel::Warn)
        };

        self.log(
            event,
            &format!(
                "{} {} [id={}]",
                if success { "Completed" } else { "Failed" },
                function,
                request_id
            ),
            level,
            LogOptions {
                request_id: Some(request_id.to_string()),
                function: Some(function.to_string()),
                duration_ms: Some(duration_ms),
                success: Some(success),
                error,
                ..Default::default()
            },
        );
    }

    pub fn protocol_violation(&self, detail: &str) {
        self.warn(
            LogEvent::ProtocolViolation,
            &format!("Ignoring malformed message: {}", detail),
            LogOptions::default(),
        );
    }

    pub fn unmatched_result(&self, request_id: &str) {
        self.debug(
            LogEvent::UnmatchedResult,
            &format!("No pending call for result [id={}]", request_id),
            LogOptions {
                request_id: Some(request_id.to_string()),
                ..Default::default()
            },
        );
    }

    pub fn worker_stop(&self) {
        let target = self.module.as_deref().unwrap_or("<unknown>");
        self.info(
            LogEvent::WorkerStop,
            &format!("Stopped pyjs for {}", target),
            LogOptions::default(),
        );
    }
}

/// Append-only, human-readable log file.
#[derive(Clone)]
pub struct AppendLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl AppendLog {
    /// Create the parent directory and start from an empty file.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        File::create(path)?;
        Self::open(path)
    }

    /// Open an existing (or new) file for appending without truncating it.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &LogEntry) -> io::Result<()> {
        let line = format_line(entry);
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())
    }

    /// Handler writing every entry to this file. Write errors are dropped.
    pub fn handler(&self) -> LogHandler {
        let sink = self.clone();
        Arc::new(move |entry: &LogEntry| {
            let _ = sink.append(entry);
        })
    }
}

fn format_line(entry: &LogEntry) -> String {
    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let mut line = format!("[{}] {}", stamp, entry.message.trim_end());
    if let Some(ref err) = entry.error {
        line.push_str(&format!("\n| error = {}", err));
    }
    if let Some(ref module) = entry.module {
        line.push_str(&format!("\n| file = {}", module));
    }
    line.push('\n');
    line
}

/// Default handler that prints JSON to stderr.
pub fn default_json_handler(entry: &LogEntry) {
    eprintln!("{}", entry.to_json());
}

/// Default handler that prints human-readable output to stderr.
pub fn default_pretty_handler(entry: &LogEntry) {
    let level = format!("{:<5}", entry.level.to_uppercase());
    let mut parts = vec![format!("[{}]", level), entry.event.clone(), entry.message.clone()];

    if let Some(ref func) = entry.function {
        parts.push(format!("fn={}", func));
    }
    if let Some(duration) = entry.duration_ms {
        parts.push(format!("{:.1}ms", duration));
    }
    if let Some(ref err) = entry.error {
        parts.push(format!("error={}", err));
    }

    eprintln!("{}", parts.join(" "));
}

fn current_timestamp() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
