//! Request/response envelopes exchanged over the worker WebSocket.
//!
//! Every inbound frame is a JSON object `{requestId, command, ...fields}`.
//! Every reply echoes the `requestId` and carries a `status`:
//!
//! ```text
//! {"requestId": "...", "status": "success", "data": ...}
//! {"requestId": "...", "status": "error", "message": "..."}
//! {"requestId": "...", "status": "error", "message": "Failed to process message", "details": "..."}
//! ```
//!
//! The `requestId` is echoed verbatim (including `null` when the client sent
//! none), so correlation stays entirely on the client side.

use serde_json::{json, Value};

/// Summary carried by replies to frames that could not be handled at all.
pub const PROCESSING_FAILED: &str = "Failed to process message";

/// Commands understood by the worker.
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
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "gitCall" => Some(Self::GitCall),
            "readFile" => Some(Self::ReadFile),
            "writeFile" => Some(Self::WriteFile),
            "browseFiles" => Some(Self::BrowseFiles),
            "sshAgentInit" => Some(Self::SshAgentInit),
            "heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }

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

/// Extract the `requestId` to echo, `null` when absent.
pub fn request_id(msg: &Value) -> Value {
    msg.get("requestId").cloned().unwrap_or(Value::Null)
}

/// Successful reply. `data` is omitted entirely when `None`.
pub fn success(request_id: &Value, data: Option<Value>) -> Value {
    let mut resp = json!({
        "requestId": request_id,
        "status": "success",
    });
    if let Some(d) = data {
        resp["data"] = d;
    }
    resp
}

/// Error reply carrying a user-facing message.
pub fn error(request_id: &Value, message: impl Into<String>) -> Value {
    json!({
        "requestId": request_id,
        "status": "error",
        "message": message.into(),
    })
}

/// Error reply for a frame whose handling blew up (bad JSON, panicked handler).
pub fn failure(request_id: &Value, details: impl Into<String>) -> Value {
    json!({
        "requestId": request_id,
        "status": "error",
        "message": PROCESSING_FAILED,
        "details": details.into(),
    })
}
