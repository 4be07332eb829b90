use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to spawn worker {file}: {source}")]
    SpawnFailure {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not connect to worker on port {port}: {reason}")]
    ConnectFailure { port: u16, reason: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Module is not ready (state: {0})")]
    NotReady(String),

    #[error("Module already started")]
    AlreadyStarted,

    #[error("Module stopped")]
    Stopped,

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::WebSocketError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
