use crate::config::BridgeOptions;
use crate::error::Result;
use crate::logging::AppendLog;
use crate::module::ModuleHandle;
use std::path::{Path, PathBuf};

/// Log file used when none is given.
pub const DEFAULT_LOG_FILE: &str = "./pyjslog/latest.log";

/// Prepared bridge: log file truncated and open, options fixed.
///
/// Modules can only be loaded from a `Bridge`, so the log sink is always set
/// up before the first worker is spawned.
///
/// ```rust,no_run
/// use pybridge::{Bridge, BridgeOptions};
///
/// let bridge = Bridge::setup(None, BridgeOptions::default())?;
/// let module = bridge.load("worker.py")?;
/// module.start(None)?;
/// # Ok::<(), pybridge::BridgeError>(())
/// ```
pub struct Bridge {
    log: AppendLog,
    options: BridgeOptions,
}

impl Bridge {
    /// Create the log directory, empty the log file and record the start.
    ///
    /// A handler already set on `options.logger` keeps receiving entries
    /// alongside the log file.
    pub fn setup(log_file: Option<&Path>, mut options: BridgeOptions) -> Result<Self> {
        let path = log_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
        let log = AppendLog::create(&path)?;

        let mut logger = options.logger.clone();
        logger.add_handler(log.handler());
        logger.bridge_setup();
        options.logger = logger;

        Ok(Self { log, options })
    }

    pub fn log_file(&self) -> &Path {
        self.log.path()
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    pub fn load(&self, file: impl AsRef<Path>) -> Result<ModuleHandle> {
        ModuleHandle::with_options(file, self.options.clone())
    }
}
