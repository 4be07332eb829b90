//! Worker process ownership: spawn, output capture, termination.

use crate::config::BridgeOptions;
use crate::error::{BridgeError, Result};
use crate::logging::{LogLevel, StructuredLogger};
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

/// How long a terminated worker may take to exit before it is killed.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// How long `terminate_and_wait` waits for the process to be reaped.
const EXIT_GRACE: Duration = Duration::from_secs(3);

/// A running (or exited) worker process.
///
/// The child itself lives in a watcher task that logs its exit; the handle
/// only keeps the kill switch and a liveness flag.
pub struct WorkerProcess {
    pid: Option<u32>,
    port: u16,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

impl WorkerProcess {
    /// Spawn `interpreter [args..] <file> <port_flag> <port>`.
    ///
    /// Must be called from within a tokio runtime. Spawn failures are not
    /// retried.
    pub fn spawn(
        file: &Path,
        port: u16,
        options: &BridgeOptions,
        logger: &StructuredLogger,
    ) -> Result<Self> {
        let mut cmd = Command::new(&options.interpreter);
        cmd.args(&options.interpreter_args)
            .arg(file)
            .arg(&options.port_flag)
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| BridgeError::SpawnFailure {
            file: file.display().to_string(),
            source,
        })?;
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_chunks(stderr, logger.clone()));
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, logger.clone()));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited) = watch::channel(false);
        tokio::spawn(watch_child(child, kill_rx, exited_tx, logger.clone()));

        Ok(Self {
            pid,
            port,
            kill_tx: Some(kill_tx),
            exited,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_alive(&self) -> bool {
        !*self.exited.borrow()
    }

    /// Ask the watcher to stop the process: SIGTERM, then SIGKILL if it is
    /// still running after a grace period. Idempotent; a process that
    /// already exited is left alone.
    pub fn terminate(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Terminate and wait until the process has been reaped.
    pub async fn terminate_and_wait(&mut self) {
        self.terminate();
        let mut exited = self.exited.clone();
        let _ = tokio::time::timeout(EXIT_GRACE, exited.wait_for(|done| *done)).await;
    }
}

async fn watch_child(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    logger: StructuredLogger,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => stop_child(&mut child, &logger).await,
    };

    match status {
        Ok(status) => logger.process_exit(status.code()),
        Err(e) => logger.process_output(LogLevel::Warn, &format!("wait failed: {}", e)),
    }
    let _ = exited_tx.send(true);
}

async fn stop_child(child: &mut Child, logger: &StructuredLogger) -> io::Result<ExitStatus> {
    if !request_exit(child) {
        let _ = child.start_kill();
    }
    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            logger.process_output(
                LogLevel::Warn,
                &format!("worker ignored SIGTERM for {:?}, killing", TERM_GRACE),
            );
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok(),
        None => false,
    }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child) -> bool {
    false
}

/// Diagnostic output goes to the log chunk by chunk, unparsed.
///
/// A multi-byte character cut off at the end of a read is held back until
/// the next read completes it.
async fn forward_chunks<R: AsyncRead + Unpin>(mut reader: R, logger: StructuredLogger) {
    let mut buf = vec![0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let complete = pending.len() - incomplete_tail(&pending);
                if complete > 0 {
                    let chunk = String::from_utf8_lossy(&pending[..complete]);
                    logger.process_output(LogLevel::Warn, &chunk);
                    pending.drain(..complete);
                }
            }
        }
    }
    if !pending.is_empty() {
        logger.process_output(LogLevel::Warn, &String::from_utf8_lossy(&pending));
    }
}

/// Length of a truncated UTF-8 sequence at the end of `bytes`, or 0.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if needed > back { back } else { 0 };
    }
    0
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, logger: StructuredLogger) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        logger.process_output(LogLevel::Debug, &line);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_logger, write_script};
    use tokio::io::AsyncWriteExt;

    fn sh_options() -> BridgeOptions {
        BridgeOptions {
            interpreter: "sh".to_string(),
            interpreter_args: vec![],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_passes_port_and_forwards_stderr() {
        let script = write_script("echo \"port $2\" >&2\nexit 3\n");
        let (logger, logs) = create_test_logger();

        let mut process = WorkerProcess::spawn(script.path(), 24567, &sh_options(), &logger).unwrap();
        assert_eq!(process.port(), 24567);
        assert!(process.pid().is_some());

        let mut exited = process.exited.clone();
        tokio::time::timeout(Duration::from_secs(5), exited.wait_for(|d| *d))
            .await
            .unwrap()
            .unwrap();
        assert!(!process.is_alive());
        // Give the stderr forwarder a moment to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let captured = logs.lock().unwrap();
        assert!(captured
            .iter()
            .any(|e| e.event == "process_output" && e.message.contains("port 24567")));
        assert!(captured
            .iter()
            .any(|e| e.event == "process_exit" && e.message.contains("(3)")));
        drop(captured);

        // Terminating an exited process is a no-op.
        process.terminate();
        process.terminate_and_wait().await;
    }

    #[tokio::test]
    async fn test_terminate_kills_and_is_idempotent() {
        let script = write_script("exec sleep 30\n");
        let (logger, _logs) = create_test_logger();

        let mut process = WorkerProcess::spawn(script.path(), 24568, &sh_options(), &logger).unwrap();
        assert!(process.is_alive());

        process.terminate_and_wait().await;
        assert!(!process.is_alive());
        process.terminate();
        process.terminate_and_wait().await;
    }

    #[tokio::test]
    async fn test_terminate_sends_sigterm_first() {
        let script = write_script("trap 'echo got-term >&2; exit 7' TERM\nwhile :; do sleep 0.1; done\n");
        let (logger, logs) = create_test_logger();

        let mut process = WorkerProcess::spawn(script.path(), 24570, &sh_options(), &logger).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        process.terminate_and_wait().await;
        assert!(!process.is_alive());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let captured = logs.lock().unwrap();
        assert!(captured
            .iter()
            .any(|e| e.event == "process_output" && e.message.contains("got-term")));
        assert!(captured
            .iter()
            .any(|e| e.event == "process_exit" && e.message.contains("(7)")));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let script = write_script("trap '' TERM\nwhile :; do sleep 0.1; done\n");
        let (logger, logs) = create_test_logger();

        let mut process = WorkerProcess::spawn(script.path(), 24571, &sh_options(), &logger).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        process.terminate_and_wait().await;
        assert!(!process.is_alive());
        assert!(started.elapsed() >= TERM_GRACE);

        let captured = logs.lock().unwrap();
        assert!(captured
            .iter()
            .any(|e| e.event == "process_exit" && e.message.contains("(signal)")));
    }

    #[test]
    fn test_incomplete_tail() {
        let text = "añ€😀".as_bytes();
        assert_eq!(incomplete_tail(text), 0);
        assert_eq!(incomplete_tail(b""), 0);
        assert_eq!(incomplete_tail(&text[..2]), 1);
        assert_eq!(incomplete_tail(&text[..4]), 1);
        assert_eq!(incomplete_tail(&text[..5]), 2);
        assert_eq!(incomplete_tail(&text[..7]), 1);
        assert_eq!(incomplete_tail(&text[..9]), 3);
    }

    #[tokio::test]
    async fn test_split_character_is_forwarded_whole() {
        let (logger, logs) = create_test_logger();
        let (mut writer, reader) = tokio::io::duplex(64);
        let forwarder = tokio::spawn(forward_chunks(reader, logger));

        let bytes = "€uro".as_bytes();
        writer.write_all(&bytes[..1]).await.unwrap();
        writer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.write_all(&bytes[1..]).await.unwrap();
        drop(writer);
        forwarder.await.unwrap();

        let joined: String = logs.lock().unwrap().iter().map(|e| e.message.clone()).collect();
        assert_eq!(joined, "€uro");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (logger, _logs) = create_test_logger();
        let options = BridgeOptions {
            interpreter: "/nonexistent/pybridge-interpreter".to_string(),
            ..Default::default()
        };

        let result = WorkerProcess::spawn(Path::new("/tmp/w.py"), 24569, &options, &logger);
        assert!(matches!(result, Err(BridgeError::SpawnFailure { .. })));
    }
}
