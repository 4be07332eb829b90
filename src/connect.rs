//! Connection establishment with exponential backoff.
//!
//! Retries are unbounded unless the caller configured a connect deadline:
//! the worker is expected to bind its port eventually, and a worker that
//! never does stalls `start()` until the module is stopped.

use crate::error::{BridgeError, Result};
use crate::logging::StructuredLogger;
use crate::metrics::Metrics;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound for a single connection attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Doubling delay, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    /// Delay before the next attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the current delay and advance to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }
}

pub fn worker_url(port: u16) -> String {
    format!("ws://127.0.0.1:{}", port)
}

/// Open a WebSocket to the worker, retrying until success or `deadline`.
pub async fn connect(
    port: u16,
    mut backoff: Backoff,
    deadline: Option<Duration>,
    logger: &StructuredLogger,
    metrics: &Metrics,
) -> Result<WsStream> {
    let url = worker_url(port);
    let give_up_at = deadline.map(|d| Instant::now() + d);

    loop {
        logger.connect_attempt(port, backoff.current().as_millis());
        metrics.record_connect_attempt();

        let reason = match tokio::time::timeout(ATTEMPT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((stream, _response))) => return Ok(stream),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "attempt timed out".to_string(),
        };
        logger.connect_failed(port, &reason);

        let delay = backoff.next_delay();
        if let Some(limit) = give_up_at {
            if Instant::now() + delay >= limit {
                return Err(BridgeError::ConnectFailure { port, reason });
            }
        }
        tokio::time::sleep(delay).await;
    }
}
