//! The open connection to one worker.
//!
//! A reader task dispatches incoming frames: discovery replies go to the
//! registry, `result` messages resolve the pending call with the same id.
//! A writer task owns the sink. When either side sees the connection end,
//! every pending call fails with `ChannelClosed`.

use crate::connect::WsStream;
use crate::error::{BridgeError, Result};
use crate::logging::StructuredLogger;
use crate::message::{Message, MessageType};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message as Frame;

type ResultSender = oneshot::Sender<Result<Value>>;

/// Calls waiting for their `result`, keyed by correlation id.
///
/// Closing and registering happen under the same lock, so a call can never
/// register after the table was drained and wait forever.
#[derive(Default)]
pub struct PendingCalls {
    inner: Mutex<PendingInner>,
}

#[derive(Default)]
struct PendingInner {
    calls: HashMap<String, ResultSender>,
    closed: bool,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, id: &str) -> Result<oneshot::Receiver<Result<Value>>> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(BridgeError::ChannelClosed);
        }
        let (tx, rx) = oneshot::channel();
        inner.calls.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Complete the call owning `id`. Returns false when no call matches.
    pub fn resolve(&self, id: &str, result: Value) -> bool {
        match self.lock().calls.remove(id) {
            Some(tx) => {
                let _ = tx.send(Ok(result));
                true
            }
            None => false,
        }
    }

    /// Drop a call that gave up waiting.
    pub fn forget(&self, id: &str) {
        self.lock().calls.remove(id);
    }

    /// Fail every outstanding call and refuse new ones.
    pub fn close_all(&self) -> usize {
        let drained: Vec<ResultSender> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.calls.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(BridgeError::ChannelClosed));
        }
        count
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Handle to the connection. Owned by exactly one module.
pub struct Channel {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<PendingCalls>,
    shutdown: watch::Sender<bool>,
}

impl Channel {
    /// Take over an open stream and start the I/O tasks.
    ///
    /// Must be called from within a tokio runtime. Returns the channel and
    /// the receiver for discovery replies.
    pub fn open(
        stream: WsStream,
        logger: StructuredLogger,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<String>>) {
        let (sink, source) = stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (list_tx, list_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pending = Arc::new(PendingCalls::default());

        tokio::spawn(write_loop(
            sink,
            outbound_rx,
            shutdown_rx.clone(),
            Arc::clone(&pending),
            logger.clone(),
        ));
        tokio::spawn(read_loop(
            source,
            list_tx,
            shutdown_rx,
            Arc::clone(&pending),
            logger,
        ));

        (
            Self {
                outbound,
                pending,
                shutdown,
            },
            list_rx,
        )
    }

    pub fn send(&self, message: Message) -> Result<()> {
        if self.pending.is_closed() {
            return Err(BridgeError::ChannelClosed);
        }
        self.outbound
            .send(message)
            .map_err(|_| BridgeError::ChannelClosed)
    }

    pub fn pending(&self) -> &PendingCalls {
        &self.pending
    }

    /// Close the connection and fail all outstanding calls. Idempotent.
    pub fn close(&self) {
        self.pending.close_all();
        self.shutdown.send_replace(true);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolves once the host closed the channel or dropped it.
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    // Drops the `watch::Ref` here; holding it across an await is not Send.
    let _ = shutdown.wait_for(|closed| *closed).await;
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut shutdown: watch::Receiver<bool>,
    pending: Arc<PendingCalls>,
    logger: StructuredLogger,
) where
    S: futures_util::Sink<Frame> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(message) = next else { break };
                let text = match message.pack() {
                    Ok(text) => text,
                    Err(e) => {
                        logger.protocol_violation(&format!("could not encode outbound message: {}", e));
                        continue;
                    }
                };
                if let Err(e) = sink.send(Frame::Text(text.into())).await {
                    logger.socket_disconnect(&format!("write failed: {}", e));
                    break;
                }
            }
            _ = closed(&mut shutdown) => break,
        }
    }

    pending.close_all();
    let _ = sink.close().await;
}

async fn read_loop<S, E>(
    mut source: S,
    list_tx: mpsc::UnboundedSender<Vec<String>>,
    mut shutdown: watch::Receiver<bool>,
    pending: Arc<PendingCalls>,
    logger: StructuredLogger,
) where
    S: futures_util::Stream<Item = std::result::Result<Frame, E>> + Unpin,
    E: std::fmt::Display,
{
    let reason = loop {
        let frame = tokio::select! {
            frame = source.next() => frame,
            _ = closed(&mut shutdown) => break "closed by host".to_string(),
        };

        match frame {
            Some(Ok(Frame::Text(text))) => dispatch(text.as_str(), &list_tx, &pending, &logger),
            Some(Ok(Frame::Close(_))) => break "closed by worker".to_string(),
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("read failed: {}", e),
            None => break "connection ended".to_string(),
        }
    };

    let failed = pending.close_all();
    logger.socket_disconnect(&format!("{} ({} pending call(s) failed)", reason, failed));
}

/// Route one incoming frame. Malformed frames are logged and dropped.
fn dispatch(
    text: &str,
    list_tx: &mpsc::UnboundedSender<Vec<String>>,
    pending: &PendingCalls,
    logger: &StructuredLogger,
) {
    let message = match Message::unpack(text).and_then(|m| m.validate().map(|_| m)) {
        Ok(message) => message,
        Err(e) => {
            logger.protocol_violation(&e.to_string());
            return;
        }
    };

    match message.msg_type {
        MessageType::List => match message.funcs {
            // Registry gone means discovery already finished.
            Some(funcs) => {
                let _ = list_tx.send(funcs);
            }
            None => logger.protocol_violation("list reply without funcs"),
        },
        MessageType::Result => {
            let id = message.id.clone().unwrap_or_default();
            if !pending.resolve(&id, message.into_result()) {
                logger.unmatched_result(&id);
            }
        }
        MessageType::Call | MessageType::Unknown => {
            logger.protocol_violation("unexpected message type from worker");
        }
    }
}
