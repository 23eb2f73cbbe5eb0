//! Client side of the worker message protocol.
//!
//! Outbound: `{"requestId": "<id>", "command": "<name>", ...payload}`.
//! Inbound: `{"requestId": "<id>", "status": "success"|"error", "data"?, "message"?}`.
//!
//! `requestId` is the only correlation key. A frame without one (the worker's
//! greeting, for example) cannot be matched to a caller and is dropped.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

use crate::error::TransportError;

/// Worker version this client expects to find on remote hosts.
pub const WORKER_VERSION: &str = "1.0.0";

/// Message used when an error reply carries no `message`.
pub const DEFAULT_ERROR_MESSAGE: &str = "Server error";

/// Wire command names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GitCall,
    ReadFile,
    WriteFile,
    BrowseFiles,
    SshAgentInit,
    Heartbeat,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GitCall => "gitCall",
            Self::ReadFile => "readFile",
            Self::WriteFile => "writeFile",
            Self::BrowseFiles => "browseFiles",
            Self::SshAgentInit => "sshAgentInit",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<unix-millis>-<10 hex chars>`, unique for the life of a connection.
pub fn new_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis}-{}", &suffix[..10])
}

/// Serialize a request. `payload` must be a JSON object (or `null` for none);
/// its fields sit next to `requestId` and `command`.
pub fn encode_request(
    request_id: &str,
    command: Command,
    payload: Value,
) -> Result<String, TransportError> {
    let mut envelope = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(TransportError::InvalidPayload(format!(
                "payload for {command} must be an object, got {other}"
            )))
        }
    };
    envelope.insert("requestId".to_string(), Value::String(request_id.to_string()));
    envelope.insert("command".to_string(), Value::String(command.as_str().to_string()));
    serde_json::to_string(&Value::Object(envelope))
        .map_err(|e| TransportError::InvalidPayload(e.to_string()))
}

/// A correlated reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub request_id: String,
    /// `Ok(data)` (`null` when absent) or `Err(message)`.
    pub outcome: Result<Value, String>,
}

/// Decode an inbound frame. `None` means it cannot be correlated.
pub fn decode_reply(text: &str) -> Option<Reply> {
    let mut value: Value = serde_json::from_str(text).ok()?;
    let request_id = value.get("requestId")?.as_str()?.to_string();
    let outcome = if value.get("status").and_then(Value::as_str) == Some("success") {
        Ok(value.get_mut("data").map(Value::take).unwrap_or(Value::Null))
    } else {
        Err(value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_ERROR_MESSAGE)
            .to_string())
    };
    Some(Reply {
        request_id,
        outcome,
    })
}
