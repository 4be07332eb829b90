use crate::channel::Channel;
use crate::error::{BridgeError, Result};
use crate::logging::StructuredLogger;
use crate::message::Message;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Names of the functions a worker exposes, in the order it reported them.
///
/// Fixed once discovery completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionSet {
    names: Vec<String>,
}

impl FunctionSet {
    pub fn new(names: Vec<String>) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        Self { names: unique }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Ask the worker for its functions until it answers.
///
/// The socket may accept before the worker's handler is ready, so the
/// request repeats every `every` until the first reply. Later replies are
/// ignored by the channel.
pub async fn discover(
    channel: &Channel,
    replies: &mut mpsc::UnboundedReceiver<Vec<String>>,
    every: Duration,
    deadline: Option<Duration>,
    logger: &StructuredLogger,
) -> Result<FunctionSet> {
    let give_up_at = deadline.map(|d| Instant::now() + d);
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let expired = async {
        match give_up_at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);

    loop {
        tokio::select! {
            reply = replies.recv() => {
                let funcs = reply.ok_or(BridgeError::ChannelClosed)?;
                let set = FunctionSet::new(funcs);
                logger.discovery_complete(set.names());
                return Ok(set);
            }
            _ = ticker.tick() => {
                channel.send(Message::create_list())?;
            }
            _ = &mut expired => {
                return Err(BridgeError::Timeout("function discovery".to_string()));
            }
        }
    }
}
