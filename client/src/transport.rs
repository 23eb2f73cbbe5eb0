//! Transport-agnostic front door.
//!
//! [`Connection`] owns at most one active [`Transport`]: a direct WebSocket,
//! a tunnel-backed WebSocket, or plain SSH exec. Switching transports closes
//! the old one first. The typed helpers turn wire replies into Rust values.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::direct::DirectTransport;
use crate::error::TransportError;
use crate::protocol::Command;
use crate::remote::{OpenSsh, RemoteHost};
use crate::ssh::SshTransport;
use crate::tunnel::TunnelManager;

/// One `browseFiles` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "isDirectory")]
    pub is_directory: bool,
}

/// `browseFiles` reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DirListing {
    pub path: String,
    pub entries: Vec<DirEntry>,
}

pub enum Transport<H: RemoteHost = OpenSsh> {
    Direct(Arc<DirectTransport>),
    Tunnel(TunnelManager<H>),
    Ssh(SshTransport<H>),
}

impl<H: RemoteHost> Transport<H> {
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Direct(_) => "direct",
            Transport::Tunnel(_) => "tunnel",
            Transport::Ssh(_) => "ssh",
        }
    }

    pub async fn call(&self, command: Command, payload: Value) -> Result<Value, TransportError> {
        match self {
            Transport::Direct(t) => t.call(command, payload).await,
            Transport::Tunnel(t) => t.call(command, payload).await,
            Transport::Ssh(t) => t.call(command, payload).await,
        }
    }

    pub async fn close(&mut self) {
        match self {
            Transport::Direct(t) => t.close(),
            Transport::Tunnel(t) => t.close().await,
            Transport::Ssh(t) => t.close().await,
        }
    }
}

pub struct Connection<H: RemoteHost = OpenSsh> {
    active: Option<Transport<H>>,
}

impl<H: RemoteHost> Default for Connection<H> {
    fn default() -> Self {
        Self { active: None }
    }
}

impl<H: RemoteHost> Connection<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    pub fn transport(&self) -> Option<&Transport<H>> {
        self.active.as_ref()
    }

    /// Attach to a worker that is already listening at `url`.
    pub async fn connect_direct(&mut self, url: &str) {
        self.disconnect().await;
        info!("Using direct transport to {url}");
        self.active = Some(Transport::Direct(Arc::new(DirectTransport::open(url))));
    }

    /// Bring `manager` up and adopt it. Subscribe to its phases before
    /// handing it over to follow progress. On failure nothing is kept.
    pub async fn connect_tunnel(&mut self, mut manager: TunnelManager<H>) -> Result<(), TransportError> {
        self.disconnect().await;
        manager.connect().await?;
        self.active = Some(Transport::Tunnel(manager));
        Ok(())
    }

    pub async fn connect_ssh(&mut self, host: H) {
        self.disconnect().await;
        info!("Using plain SSH transport to {}", host.describe());
        self.active = Some(Transport::Ssh(SshTransport::new(host)));
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut transport) = self.active.take() {
            info!("Closing {} transport", transport.kind());
            transport.close().await;
        }
    }

    pub async fn call(&self, command: Command, payload: Value) -> Result<Value, TransportError> {
        match &self.active {
            Some(t) => t.call(command, payload).await,
            None => Err(TransportError::NotConnected),
        }
    }

    /// Run git in `repo` and return its stdout.
    pub async fn git<S: AsRef<str>>(&self, repo: &str, args: &[S]) -> Result<String, TransportError> {
        let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
        let data = self
            .call(Command::GitCall, json!({"repo_path": repo, "args": args}))
            .await?;
        expect_string(data, Command::GitCall)
    }

    /// Read a file relative to `repo`. `Ok(None)` only when `null_if_missing`
    /// is set and the file does not exist.
    pub async fn read_file(
        &self,
        repo: &str,
        file: &str,
        null_if_missing: bool,
    ) -> Result<Option<String>, TransportError> {
        let mut payload = json!({"repo_path": repo, "file_path": file});
        if null_if_missing {
            payload["options"] = json!({"nullIfNotExists": true});
        }
        match self.call(Command::ReadFile, payload).await? {
            Value::Null => Ok(None),
            other => expect_string(other, Command::ReadFile).map(Some),
        }
    }

    pub async fn write_file(
        &self,
        repo: &str,
        file: &str,
        content: &str,
        make_directory: bool,
    ) -> Result<(), TransportError> {
        let mut payload = json!({"repo_path": repo, "file_path": file, "content": content});
        if make_directory {
            payload["options"] = json!({"makeDirectory": true});
        }
        self.call(Command::WriteFile, payload).await.map(drop)
    }

    pub async fn browse(&self, path: &str) -> Result<DirListing, TransportError> {
        let data = self.call(Command::BrowseFiles, json!({"path": path})).await?;
        serde_json::from_value(data)
            .map_err(|e| TransportError::InvalidPayload(format!("browseFiles reply: {e}")))
    }

    pub async fn heartbeat(&self) -> Result<(), TransportError> {
        self.call(Command::Heartbeat, json!({})).await.map(drop)
    }

    /// Load `private_key` into a per-connection agent on the worker.
    pub async fn ssh_agent_init(&self, private_key: &str) -> Result<(), TransportError> {
        self.call(Command::SshAgentInit, json!({"privateKey": private_key}))
            .await
            .map(drop)
    }
}

fn expect_string(data: Value, command: Command) -> Result<String, TransportError> {
    match data {
        Value::String(s) => Ok(s),
        other => Err(TransportError::InvalidPayload(format!(
            "{command} reply must be a string, got {other}"
        ))),
    }
}
