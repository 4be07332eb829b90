use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    List,
    Call,
    Result,
    #[serde(other)]
    Unknown,
}

/// One protocol message, as exchanged in a single text frame.
///
/// The same shape serves both directions: a host `list` carries no
/// `funcs`, the worker's `list` reply does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub func: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub args: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub funcs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub result: Option<Value>,
}

impl Message {
    pub fn new(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            id: None,
            func: None,
            args: None,
            funcs: None,
            result: None,
        }
    }

    /// Discovery request sent by the host.
    pub fn create_list() -> Self {
        Self::new(MessageType::List)
    }

    /// Discovery reply sent by the worker.
    pub fn create_list_response(funcs: Vec<String>) -> Self {
        Self {
            funcs: Some(funcs),
            ..Self::new(MessageType::List)
        }
    }

    /// Call request with a fresh correlation id.
    pub fn create_call(func: &str, args: Vec<Value>) -> Self {
        Self {
            id: Some(new_correlation_id()),
            func: Some(func.to_string()),
            args: Some(args),
            ..Self::new(MessageType::Call)
        }
    }

    pub fn create_result(result: Value, id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            result: Some(result),
            ..Self::new(MessageType::Result)
        }
    }

    pub fn pack(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn unpack(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| BridgeError::ProtocolViolation(format!("undecodable message: {}", e)))
    }

    /// Check that the fields required by the declared type are present.
    pub fn validate(&self) -> Result<()> {
        match self.msg_type {
            MessageType::Call => {
                if self.func.is_none() || self.id.as_deref().map_or(true, str::is_empty) {
                    return Err(BridgeError::ProtocolViolation(
                        "call message missing func or id".to_string(),
                    ));
                }
            }
            MessageType::Result => {
                if self.id.as_deref().map_or(true, str::is_empty) {
                    return Err(BridgeError::ProtocolViolation(
                        "result message missing id".to_string(),
                    ));
                }
            }
            MessageType::List => {}
            MessageType::Unknown => {
                return Err(BridgeError::ProtocolViolation(
                    "unknown message type".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Result payload; an absent or null `result` is JSON null.
    pub fn into_result(self) -> Value {
        self.result.unwrap_or(Value::Null)
    }
}

/// Short random token, unique among the calls outstanding on one channel.
pub fn new_correlation_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}
