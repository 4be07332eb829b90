use crate::error::Result;
use crate::logging::StructuredLogger;
use crate::module::ModuleHandle;
use std::env;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the worker interpreter.
pub const INTERPRETER_ENV: &str = "PYBRIDGE_PYTHON";

/// Flag the worker reads its listening port from.
pub const DEFAULT_PORT_FLAG: &str = "--pyjs-port";

/// Settings shared by every module handle.
///
/// `connect_deadline`, `discovery_deadline` and `call_timeout` default to
/// `None`: a worker that never binds its port stalls `start()` forever, and a
/// call whose result never arrives blocks until `stop()`.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    pub port_flag: String,
    pub port_range: Range<u16>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub discovery_interval: Duration,
    pub connect_deadline: Option<Duration>,
    pub discovery_deadline: Option<Duration>,
    pub call_timeout: Option<Duration>,
    pub logger: StructuredLogger,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            interpreter: "python".to_string(),
            interpreter_args: vec!["-u".to_string()],
            port_flag: DEFAULT_PORT_FLAG.to_string(),
            port_range: 20000..30000,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(400),
            discovery_interval: Duration::from_millis(50),
            connect_deadline: None,
            discovery_deadline: None,
            call_timeout: None,
            logger: StructuredLogger::disabled(),
        }
    }
}

impl BridgeOptions {
    /// Defaults, with the interpreter taken from `PYBRIDGE_PYTHON` when set.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(interpreter) = env::var(INTERPRETER_ENV) {
            if !interpreter.trim().is_empty() {
                options.interpreter = interpreter;
            }
        }
        options
    }
}

/// Builder for a [`ModuleHandle`] with non-default options.
///
/// ```rust,no_run
/// use pybridge::ModuleBuilder;
/// use std::time::Duration;
///
/// let module = ModuleBuilder::new("worker.py")
///     .interpreter("python3")
///     .connect_deadline(Duration::from_secs(10))
///     .build()?;
/// module.start(None)?;
/// # Ok::<(), pybridge::BridgeError>(())
/// ```
pub struct ModuleBuilder {
    file: PathBuf,
    options: BridgeOptions,
}

impl ModuleBuilder {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            options: BridgeOptions::from_env(),
        }
    }

    pub fn options(mut self, options: BridgeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn interpreter(mut self, interpreter: &str) -> Self {
        self.options.interpreter = interpreter.to_string();
        self
    }

    pub fn interpreter_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.interpreter_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn port_flag(mut self, flag: &str) -> Self {
        self.options.port_flag = flag.to_string();
        self
    }

    pub fn port_range(mut self, range: Range<u16>) -> Self {
        self.options.port_range = range;
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.options.initial_backoff = initial;
        self.options.max_backoff = max;
        self
    }

    pub fn discovery_interval(mut self, interval: Duration) -> Self {
        self.options.discovery_interval = interval;
        self
    }

    pub fn connect_deadline(mut self, deadline: Duration) -> Self {
        self.options.connect_deadline = Some(deadline);
        self
    }

    pub fn discovery_deadline(mut self, deadline: Duration) -> Self {
        self.options.discovery_deadline = Some(deadline);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.options.call_timeout = Some(timeout);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.options.logger = logger;
        self
    }

    pub fn build(self) -> Result<ModuleHandle> {
        ModuleHandle::with_options(self.file, self.options)
    }
}
