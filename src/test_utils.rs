//! Test helpers: an in-process fake worker speaking the wire protocol,
//! a capturing logger and a throwaway worker process.

use crate::config::BridgeOptions;
use crate::logging::{LogEntry, LogLevel, StructuredLogger};
use crate::message::{Message, MessageType};
use crate::module::ModuleHandle;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as Frame;

/// How the fake worker misbehaves.
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    pub funcs: Vec<String>,
    /// Drop this many `list` requests before answering.
    pub ignore_first_lists: usize,
    pub never_list: bool,
    /// Precede every result with an unmatched result and malformed frames.
    pub noise: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            funcs: ["add", "echo", "wait", "hang", "crash"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignore_first_lists: 0,
            never_list: false,
            noise: false,
        }
    }
}

#[derive(Default)]
struct FakeStats {
    list_requests: AtomicUsize,
    calls: AtomicUsize,
}

enum Outgoing {
    Text(String),
    Close,
}

/// WebSocket server implementing the worker side of the protocol.
///
/// Functions: `add(a, b)`, `echo(x)`, `wait(ms, x)` (returns `x` after `ms`),
/// `hang()` (never answers), `crash()` (closes the connection).
pub struct FakeWorker {
    port: u16,
    stats: Arc<FakeStats>,
    runtime: Option<Runtime>,
}

impl FakeWorker {
    pub fn start() -> Self {
        Self::start_with(FakeBehavior::default())
    }

    pub fn start_on(port: u16) -> Self {
        Self::serve(port, FakeBehavior::default())
    }

    pub fn start_with(behavior: FakeBehavior) -> Self {
        Self::serve(0, behavior)
    }

    fn serve(port: u16, behavior: FakeBehavior) -> Self {
        let listener = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();

        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let stats = Arc::new(FakeStats::default());
        let behavior = Arc::new(behavior);

        let accept_stats = Arc::clone(&stats);
        runtime.spawn(async move {
            let listener = TcpListener::from_std(listener).unwrap();
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&behavior),
                    Arc::clone(&accept_stats),
                ));
            }
        });

        Self {
            port,
            stats,
            runtime: Some(runtime),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn list_requests(&self) -> usize {
        self.stats.list_requests.load(Ordering::SeqCst)
    }

    pub fn calls_received(&self) -> usize {
        self.stats.calls.load(Ordering::SeqCst)
    }
}

impl Drop for FakeWorker {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn serve_connection(stream: TcpStream, behavior: Arc<FakeBehavior>, stats: Arc<FakeStats>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();

    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outgoing::Text(text) => {
                    if sink.send(Frame::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    let mut lists_seen = 0;
    while let Some(Ok(frame)) = source.next().await {
        let Frame::Text(text) = frame else { continue };
        let Ok(message) = Message::unpack(text.as_str()) else {
            continue;
        };

        match message.msg_type {
            MessageType::List => {
                stats.list_requests.fetch_add(1, Ordering::SeqCst);
                lists_seen += 1;
                if behavior.never_list || lists_seen <= behavior.ignore_first_lists {
                    continue;
                }
                let reply = Message::create_list_response(behavior.funcs.clone());
                let _ = tx.send(Outgoing::Text(reply.pack().unwrap()));
            }
            MessageType::Call => {
                stats.calls.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(answer_call(message, Arc::clone(&behavior), tx.clone()));
            }
            _ => {}
        }
    }

    drop(tx);
    let _ = writer.await;
}

async fn answer_call(message: Message, behavior: Arc<FakeBehavior>, tx: mpsc::UnboundedSender<Outgoing>) {
    let id = message.id.clone().unwrap_or_default();
    let args = message.args.clone().unwrap_or_default();

    let result = match message.func.as_deref() {
        Some("add") => {
            let a = args.first().and_then(Value::as_i64).unwrap_or(0);
            let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
            json!(a + b)
        }
        Some("echo") => args.first().cloned().unwrap_or(Value::Null),
        Some("wait") => {
            let ms = args.first().and_then(Value::as_u64).unwrap_or(10);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            args.get(1).cloned().unwrap_or(Value::Null)
        }
        Some("hang") => return,
        Some("crash") => {
            let _ = tx.send(Outgoing::Close);
            return;
        }
        _ => Value::Null,
    };

    if behavior.noise {
        let stray = Message::create_result(json!("not yours"), "no-such-call");
        let _ = tx.send(Outgoing::Text(stray.pack().unwrap()));
        let _ = tx.send(Outgoing::Text(r#"{"type":"result","result":1}"#.to_string()));
        let _ = tx.send(Outgoing::Text("%%% not json".to_string()));
    }

    let reply = Message::create_result(result, &id);
    let _ = tx.send(Outgoing::Text(reply.pack().unwrap()));
}

/// Logger capturing every entry at debug level.
pub fn create_test_logger() -> (StructuredLogger, Arc<Mutex<Vec<LogEntry>>>) {
    let logs = Arc::new(Mutex::new(Vec::new()));
    let logs_clone = Arc::clone(&logs);

    let handler = Arc::new(move |entry: &LogEntry| {
        logs_clone.lock().unwrap().push(entry.clone());
    });

    (StructuredLogger::new(Some(handler), LogLevel::Debug), logs)
}

/// Shell script to run with `sh` as a stand-in worker process.
pub fn write_script(body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .prefix("pybridge-worker-")
        .suffix(".sh")
        .tempfile()
        .unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Module whose worker process just sleeps; pair it with a [`FakeWorker`]
/// listening on the port passed to `start`.
pub fn sleeper_module(configure: impl FnOnce(&mut BridgeOptions)) -> (ModuleHandle, NamedTempFile) {
    let script = write_script("exec sleep 30\n");
    let mut options = BridgeOptions {
        interpreter: "sh".to_string(),
        interpreter_args: vec![],
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        discovery_interval: Duration::from_millis(20),
        connect_deadline: Some(Duration::from_secs(10)),
        discovery_deadline: Some(Duration::from_secs(10)),
        ..Default::default()
    };
    configure(&mut options);

    let module = ModuleHandle::with_options(script.path(), options).unwrap();
    (module, script)
}

/// Poll `condition` until it holds or `limit` passes.
pub fn wait_until(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

/// A port nothing is listening on.
pub fn get_test_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr().map(|a| a.port()))
        .unwrap_or(5555)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_worker_binds_port() {
        let worker = FakeWorker::start();
        assert_ne!(worker.port(), 0);
        assert!(std::net::TcpStream::connect(("127.0.0.1", worker.port())).is_ok());
        assert_eq!(worker.list_requests(), 0);
    }

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(50), || true));
        assert!(!wait_until(Duration::from_millis(30), || false));
    }
}
