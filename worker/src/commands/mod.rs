//! Handlers for the worker's command set.
//!
//! Each handler takes the raw inbound envelope, validates the fields it needs
//! and returns the `data` to reply with. Validation and sandbox failures are
//! reported before any subprocess or filesystem access happens.

pub mod browse;
pub mod files;
pub mod git;

use serde_json::Value;

use crate::agent::AgentError;
use crate::process::ProcessError;

/// Failure of a single command. `Display` is the exact reply `message`.
#[derive(Debug)]
pub enum CommandError {
    /// Missing or malformed field.
    Validation(String),
    /// Resolved path escapes the repository root.
    AccessDenied(String),
    /// Repository, file or directory does not exist.
    NotFound(String),
    /// A spawned program failed; carries its diagnostic text verbatim.
    Process(String),
    Io(std::io::Error),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Validation(msg) | CommandError::NotFound(msg) | CommandError::Process(msg) => {
                f.write_str(msg)
            }
            CommandError::AccessDenied(path) => {
                write!(f, "Access denied: path outside repository: {path}")
            }
            CommandError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CommandError {}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        CommandError::Io(e)
    }
}

impl From<ProcessError> for CommandError {
    fn from(e: ProcessError) -> Self {
        CommandError::Process(e.to_string())
    }
}

impl From<AgentError> for CommandError {
    fn from(e: AgentError) -> Self {
        CommandError::Process(e.to_string())
    }
}

/// Required non-empty string field.
pub(crate) fn required_str<'a>(msg: &'a Value, field: &str) -> Result<&'a str, CommandError> {
    match msg.get(field).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(CommandError::Validation(format!(
            "{field} must be a non-empty string"
        ))),
    }
}

/// Boolean flag under `options`, `false` when absent.
pub(crate) fn option_flag(msg: &Value, name: &str) -> bool {
    msg.get("options")
        .and_then(|o| o.get(name))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
