//! Module handles: one worker process, one channel, its discovered functions.
//!
//! Every public method blocks the calling thread. The socket is driven by a
//! private tokio runtime owned by the handle, so a thread waiting for a
//! result never stalls the I/O that delivers it. Do not call these methods
//! from inside an async context.

use crate::call_macro::CallArgs;
use crate::channel::Channel;
use crate::config::BridgeOptions;
use crate::connect::{self, Backoff};
use crate::error::{BridgeError, Result};
use crate::logging::StructuredLogger;
use crate::message::Message;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::registry::{self, FunctionSet};
use crate::supervisor::WorkerProcess;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{oneshot, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unstarted,
    Starting,
    Connecting,
    Discovering,
    Ready,
    Stopped,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Unstarted => "unstarted",
            ModuleState::Starting => "starting",
            ModuleState::Connecting => "connecting",
            ModuleState::Discovering => "discovering",
            ModuleState::Ready => "ready",
            ModuleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

struct Running {
    runtime: Arc<Runtime>,
    process: WorkerProcess,
    channel: Option<Arc<Channel>>,
}

/// A loaded worker file.
///
/// ```rust,no_run
/// let module = pybridge::load("worker.py")?;
/// module.start(None)?;
/// let sum = module.call("add", vec![2.into(), 3.into()])?;
/// assert_eq!(sum, 5);
/// module.stop();
/// # Ok::<(), pybridge::BridgeError>(())
/// ```
pub struct ModuleHandle {
    file: PathBuf,
    options: BridgeOptions,
    logger: StructuredLogger,
    metrics: Metrics,
    state: Mutex<ModuleState>,
    running: Mutex<Option<Running>>,
    functions: RwLock<FunctionSet>,
    shutdown: watch::Sender<bool>,
}

impl ModuleHandle {
    /// Construct without starting anything.
    pub fn with_options(file: impl AsRef<Path>, options: BridgeOptions) -> Result<Self> {
        let file = std::path::absolute(file.as_ref())?;
        let logger = options.logger.for_module(&file);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            file,
            options,
            logger,
            metrics: Metrics::new(),
            state: Mutex::new(ModuleState::Unstarted),
            running: Mutex::new(None),
            functions: RwLock::new(FunctionSet::default()),
            shutdown,
        })
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    pub fn state(&self) -> ModuleState {
        *self.lock_state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Port of the running worker.
    pub fn port(&self) -> Option<u16> {
        self.lock_running().as_ref().map(|r| r.process.port())
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_running().as_ref().and_then(|r| r.process.pid())
    }

    pub fn is_worker_alive(&self) -> bool {
        self.lock_running()
            .as_ref()
            .is_some_and(|r| r.process.is_alive())
    }

    /// Discovered function names, in worker order. Empty before `Ready`.
    pub fn functions(&self) -> Vec<String> {
        self.read_functions().names().to_vec()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.read_functions().contains(name)
    }

    /// Spawn the worker, connect, and discover its functions.
    ///
    /// Blocks until the module is `Ready`. Without a connect deadline this
    /// waits for as long as the worker takes to bind its port; `stop()` from
    /// another thread aborts it with [`BridgeError::Stopped`].
    pub fn start(&self, port: Option<u16>) -> Result<()> {
        {
            let mut state = self.lock_state();
            match *state {
                ModuleState::Unstarted => *state = ModuleState::Starting,
                ModuleState::Stopped => return Err(BridgeError::Stopped),
                _ => return Err(BridgeError::AlreadyStarted),
            }
        }

        let result = self.run_start(port);
        if result.is_err() {
            self.abort_start();
        }
        result
    }

    fn run_start(&self, port: Option<u16>) -> Result<()> {
        let runtime = Arc::new(
            Builder::new_multi_thread()
                .worker_threads(2)
                .thread_name("pybridge-io")
                .enable_all()
                .build()?,
        );

        let (port, caller_chosen) = match port {
            Some(port) => (port, true),
            None => (self.random_port(), false),
        };
        self.logger.process_spawn(port, caller_chosen);

        let process = {
            let _guard = runtime.enter();
            WorkerProcess::spawn(&self.file, port, &self.options, &self.logger)?
        };
        *self.lock_running() = Some(Running {
            runtime: Arc::clone(&runtime),
            process,
            channel: None,
        });

        self.set_state(ModuleState::Connecting);
        let mut shutdown = self.shutdown.subscribe();
        let functions = runtime.block_on(async {
            tokio::select! {
                result = self.establish(port) => result,
                _ = shutdown.wait_for(|stopped| *stopped) => Err(BridgeError::Stopped),
            }
        })?;

        let mut state = self.lock_state();
        if *state == ModuleState::Stopped {
            return Err(BridgeError::Stopped);
        }
        *self.functions.write().unwrap_or_else(PoisonError::into_inner) = functions;
        *state = ModuleState::Ready;
        Ok(())
    }

    async fn establish(&self, port: u16) -> Result<FunctionSet> {
        let backoff = Backoff::new(self.options.initial_backoff, self.options.max_backoff);
        let stream = connect::connect(
            port,
            backoff,
            self.options.connect_deadline,
            &self.logger,
            &self.metrics,
        )
        .await?;
        self.logger.socket_connect(port);

        let (channel, mut replies) = Channel::open(stream, self.logger.clone());
        let channel = Arc::new(channel);
        match self.lock_running().as_mut() {
            Some(running) => running.channel = Some(Arc::clone(&channel)),
            None => return Err(BridgeError::Stopped),
        }

        self.set_state(ModuleState::Discovering);
        registry::discover(
            &channel,
            &mut replies,
            self.options.discovery_interval,
            self.options.discovery_deadline,
            &self.logger,
        )
        .await
    }

    fn abort_start(&self) {
        *self.lock_state() = ModuleState::Stopped;
        self.shutdown.send_replace(true);
        self.teardown();
    }

    /// Terminate the worker and close the channel.
    ///
    /// Calls still waiting for a result fail with
    /// [`BridgeError::ChannelClosed`]. Safe to call repeatedly or before
    /// `start()`.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        {
            let mut state = self.lock_state();
            if *state == ModuleState::Stopped {
                return;
            }
            *state = ModuleState::Stopped;
        }
        self.teardown();
        self.logger.worker_stop();
    }

    fn teardown(&self) {
        let Some(mut running) = self.lock_running().take() else {
            return;
        };

        if let Some(channel) = running.channel.take() {
            channel.close();
        }

        // Blocking on the runtime is only allowed outside async contexts.
        if Handle::try_current().is_err() {
            running.runtime.block_on(running.process.terminate_and_wait());
        } else {
            running.process.terminate();
        }

        match Arc::try_unwrap(running.runtime) {
            Ok(runtime) => runtime.shutdown_background(),
            // A blocked start() or call still holds it and drops it on return.
            Err(shared) => drop(shared),
        }
    }

    /// Invoke a remote function and block until its result arrives.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let (channel, runtime) = self.ready_channel(name)?;

        let message = Message::create_call(name, args);
        let id = message.id.clone().unwrap_or_default();
        self.logger
            .request_start(&id, name, message.args.as_deref().unwrap_or_default());

        let rx = channel.pending().register(&id)?;
        let started = self.metrics.start_call();
        let outcome = channel
            .send(message)
            .and_then(|_| self.wait_for_result(name, &runtime, rx));

        if outcome.is_err() {
            channel.pending().forget(&id);
        }
        let latency = self.metrics.end_call(started, outcome.is_ok());
        self.logger.request_end(
            &id,
            name,
            latency,
            outcome.as_ref().err().map(ToString::to_string),
        );
        outcome
    }

    /// Invoke and decode the result into `T`.
    pub fn call_as<T: DeserializeOwned>(&self, name: &str, args: Vec<Value>) -> Result<T> {
        let value = self.call(name, args)?;
        serde_json::from_value(value).map_err(BridgeError::JsonError)
    }

    /// Invoke with a tuple of arguments, e.g. `module.call_with("add", (2, 3))`.
    pub fn call_with<A: CallArgs>(&self, name: &str, args: A) -> Result<Value> {
        self.call(name, args.to_json_args())
    }

    /// Proxy for one discovered function.
    pub fn function(&self, name: &str) -> Result<FunctionProxy<'_>> {
        self.check_callable(name)?;
        Ok(FunctionProxy {
            module: self,
            name: name.to_string(),
        })
    }

    fn wait_for_result(
        &self,
        name: &str,
        runtime: &Runtime,
        rx: oneshot::Receiver<Result<Value>>,
    ) -> Result<Value> {
        match self.options.call_timeout {
            None => rx
                .blocking_recv()
                .unwrap_or_else(|_| Err(BridgeError::ChannelClosed)),
            Some(limit) => {
                // The timer must be created inside the runtime.
                let waited = runtime.block_on(async move { tokio::time::timeout(limit, rx).await });
                match waited {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => Err(BridgeError::ChannelClosed),
                    Err(_) => Err(BridgeError::Timeout(format!("result of {}", name))),
                }
            }
        }
    }

    fn check_callable(&self, name: &str) -> Result<()> {
        match self.state() {
            ModuleState::Ready => {}
            ModuleState::Stopped => return Err(BridgeError::ChannelClosed),
            other => return Err(BridgeError::NotReady(other.to_string())),
        }
        if !self.has_function(name) {
            return Err(BridgeError::UnknownFunction(name.to_string()));
        }
        Ok(())
    }

    fn ready_channel(&self, name: &str) -> Result<(Arc<Channel>, Arc<Runtime>)> {
        self.check_callable(name)?;
        let running = self.lock_running();
        let running = running.as_ref().ok_or(BridgeError::ChannelClosed)?;
        let channel = running.channel.as_ref().ok_or(BridgeError::ChannelClosed)?;
        Ok((Arc::clone(channel), Arc::clone(&running.runtime)))
    }

    fn random_port(&self) -> u16 {
        let range = self.options.port_range.clone();
        if range.is_empty() {
            return range.start;
        }
        rand::thread_rng().gen_range(range)
    }

    fn set_state(&self, next: ModuleState) {
        let mut state = self.lock_state();
        if *state != ModuleState::Stopped {
            *state = next;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ModuleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_functions(&self) -> std::sync::RwLockReadGuard<'_, FunctionSet> {
        self.functions.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("file", &self.file)
            .field("state", &self.state())
            .field("functions", &self.functions())
            .finish()
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stand-in for one remote function, bound to its module.
#[derive(Debug, Clone)]
pub struct FunctionProxy<'a> {
    module: &'a ModuleHandle,
    name: String,
}

impl FunctionProxy<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        self.module.call(&self.name, args)
    }

    pub fn invoke_with<A: CallArgs>(&self, args: A) -> Result<Value> {
        self.module.call_with(&self.name, args)
    }

    pub fn invoke_as<T: DeserializeOwned>(&self, args: Vec<Value>) -> Result<T> {
        self.module.call_as(&self.name, args)
    }
}
