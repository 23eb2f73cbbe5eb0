//! Worker-less transport: each call becomes one `ssh` invocation.
//!
//! Git runs as `git -C <repo>`, reads use `cat`, and writes pipe base64
//! through `base64 -d`. Nothing is sandboxed here; the remote user's own
//! permissions apply. Directory browsing and agent init need the worker and
//! are refused.

use base64::Engine as _;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::protocol::Command;
use crate::remote::{capture, sq, RemoteHost};

pub const BROWSE_UNSUPPORTED: &str = "File browsing is not supported in SSH mode";
pub const AGENT_UNSUPPORTED: &str = "SSH agent init is not needed in SSH mode";

pub struct SshTransport<H: RemoteHost> {
    host: H,
}

impl<H: RemoteHost> SshTransport<H> {
    pub fn new(host: H) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub async fn call(&self, command: Command, payload: Value) -> Result<Value, TransportError> {
        match command {
            Command::GitCall => self.git_call(&payload).await,
            Command::ReadFile => self.read_file(&payload).await,
            Command::WriteFile => self.write_file(&payload).await,
            Command::BrowseFiles => Err(TransportError::Remote(BROWSE_UNSUPPORTED.to_string())),
            Command::SshAgentInit => Err(TransportError::Remote(AGENT_UNSUPPORTED.to_string())),
            // Every call opens its own ssh session; there is nothing to keep alive.
            Command::Heartbeat => Ok(Value::Null),
        }
    }

    async fn git_call(&self, payload: &Value) -> Result<Value, TransportError> {
        let repo = required_str(payload, "repo_path")?;
        let args = payload
            .get("args")
            .and_then(Value::as_array)
            .and_then(|items| items.iter().map(Value::as_str).collect::<Option<Vec<_>>>())
            .ok_or_else(|| {
                TransportError::InvalidPayload("args must be an array of strings".to_string())
            })?;

        // The assignment must stay unquoted for the shell to treat it as one.
        let mut remote_cmd = format!("LC_ALL=C git -C {}", sq(repo));
        for arg in args {
            remote_cmd.push(' ');
            remote_cmd.push_str(&sq(arg));
        }

        let out = capture(self.host.command(&remote_cmd)).await?;
        if out.exit_code == 0 {
            return Ok(Value::String(out.stdout));
        }
        Err(TransportError::Process(first_non_empty(
            &[&out.stderr, &out.stdout],
            "Git command failed",
        )))
    }

    async fn read_file(&self, payload: &Value) -> Result<Value, TransportError> {
        let path = full_path(payload)?;
        let out = capture(self.host.command(&format!("cat {}", sq(&path)))).await?;
        if out.exit_code == 0 {
            return Ok(Value::String(out.stdout));
        }
        if option_flag(payload, "nullIfNotExists") {
            debug!("Remote read of {path} failed, returning null");
            return Ok(Value::Null);
        }
        Err(TransportError::Process(first_non_empty(
            &[&out.stderr],
            "Read file failed",
        )))
    }

    async fn write_file(&self, payload: &Value) -> Result<Value, TransportError> {
        let path = full_path(payload)?;
        let content = payload
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::InvalidPayload("content must be a string".to_string()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);

        let mut remote_cmd = format!(
            "printf '%s' {} | base64 -d > {}",
            sq(&encoded),
            sq(&path)
        );
        if option_flag(payload, "makeDirectory") {
            remote_cmd = format!("mkdir -p \"$(dirname {})\" && {remote_cmd}", sq(&path));
        }

        let out = capture(self.host.command(&remote_cmd)).await?;
        if out.exit_code == 0 {
            Ok(Value::Null)
        } else {
            Err(TransportError::Process(first_non_empty(
                &[&out.stderr],
                "Write file failed",
            )))
        }
    }

    /// Release the shared master connection, if any. Best-effort.
    pub async fn close(&self) {
        let Some(cmd) = self.host.shutdown() else {
            return;
        };
        match capture(cmd).await {
            Ok(out) if out.exit_code == 0 => debug!("Closed SSH master for {}", self.host.describe()),
            Ok(out) => debug!("SSH master exit: {}", out.stderr.trim()),
            Err(e) => warn!("Failed to close SSH master: {e}"),
        }
    }
}

fn required_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str, TransportError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TransportError::InvalidPayload(format!("{field} must be a non-empty string")))
}

fn option_flag(payload: &Value, name: &str) -> bool {
    payload
        .get("options")
        .and_then(|o| o.get(name))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// `file_path` if absolute, else joined under `repo_path`.
fn full_path(payload: &Value) -> Result<String, TransportError> {
    let repo = required_str(payload, "repo_path")?;
    let file = required_str(payload, "file_path")?;
    if file.starts_with('/') {
        Ok(file.to_string())
    } else {
        Ok(format!("{}/{file}", repo.trim_end_matches('/')))
    }
}

fn first_non_empty(candidates: &[&str], fallback: &str) -> String {
    candidates
        .iter()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}
