//! Remote host access over the local OpenSSH client.
//!
//! [`RemoteHost`] produces ready-to-spawn [`Command`]s for the three things
//! the tunnel needs: run a remote shell command, upload a file, and hold open
//! a local port forward. [`OpenSsh`] is the real implementation; tests plug in
//! a host that runs everything locally.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::error::TransportError;

/// Builds the commands used to reach one remote host.
pub trait RemoteHost: Send + Sync {
    /// Run `remote_cmd` through the remote user's shell. `remote_cmd` is
    /// passed as one pre-quoted string.
    fn command(&self, remote_cmd: &str) -> Command;

    /// Copy `local` to `remote` (relative to the remote home directory).
    fn upload(&self, local: &Path, remote: &str) -> Command;

    /// Forward `127.0.0.1:local_port` to `127.0.0.1:remote_port` on the host
    /// until killed.
    fn forward(&self, local_port: u16, remote_port: u16) -> Command;

    /// `user@host:port`, for logs.
    fn describe(&self) -> String;

    /// Command releasing any shared connection state, run when a transport
    /// built on this host closes.
    fn shutdown(&self) -> Option<Command> {
        None
    }
}

/// `ssh`/`scp` invocations against `user@host`.
#[derive(Debug, Clone)]
pub struct OpenSsh {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: Option<PathBuf>,
    /// Multiplex every invocation over one master connection at this socket.
    pub control_path: Option<String>,
}

impl OpenSsh {
    pub fn new(host: &str, port: u16, user: &str, key_path: Option<PathBuf>) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            key_path,
            control_path: None,
        }
    }

    /// Enable `ControlMaster` multiplexing with a per-destination socket
    /// under `/tmp`.
    #[must_use]
    pub fn with_control_master(mut self) -> Self {
        let slug: String = format!("{}-{}-{}", self.host, self.port, self.user)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        self.control_path = Some(format!("/tmp/gityak-{slug}"));
        self
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn common_options(&self, cmd: &mut Command) {
        cmd.args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=accept-new"]);
        if let Some(key) = &self.key_path {
            cmd.arg("-i").arg(key);
        }
    }

    /// `ssh -O exit` for the control master, if one is configured.
    pub fn close_master(&self) -> Option<Command> {
        let control = self.control_path.as_ref()?;
        let mut cmd = Command::new("ssh");
        cmd.args(["-O", "exit", "-o"])
            .arg(format!("ControlPath={control}"))
            .arg(self.destination());
        Some(cmd)
    }
}

impl RemoteHost for OpenSsh {
    fn command(&self, remote_cmd: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p").arg(self.port.to_string());
        if let Some(control) = &self.control_path {
            cmd.args(["-o", "ControlMaster=auto", "-o"])
                .arg(format!("ControlPath={control}"))
                .args(["-o", "ControlPersist=60"]);
        }
        self.common_options(&mut cmd);
        cmd.args(["-o", "SendEnv=NONE"]);
        cmd.arg(self.destination()).arg(remote_cmd);
        cmd
    }

    fn upload(&self, local: &Path, remote: &str) -> Command {
        let mut cmd = Command::new("scp");
        cmd.arg("-P").arg(self.port.to_string());
        self.common_options(&mut cmd);
        cmd.arg(local)
            .arg(format!("{}:{remote}", self.destination()));
        cmd
    }

    fn forward(&self, local_port: u16, remote_port: u16) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p").arg(self.port.to_string());
        self.common_options(&mut cmd);
        cmd.args(["-o", "ExitOnForwardFailure=yes", "-L"])
            .arg(format!("{local_port}:127.0.0.1:{remote_port}"))
            .arg("-N")
            .arg(self.destination());
        cmd
    }

    fn describe(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    fn shutdown(&self) -> Option<Command> {
        self.close_master()
    }
}

/// Quote `arg` as a single-quoted POSIX shell word.
pub fn sq(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Captured result of a local helper process.
#[derive(Debug)]
pub struct Captured {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run `cmd` to completion, capturing output. Stdin is closed.
pub async fn capture(mut cmd: Command) -> Result<Captured, TransportError> {
    let out = cmd
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| TransportError::Process(format!("Failed to spawn process: {e}")))?;
    Ok(Captured {
        exit_code: out.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    })
}

/// Run `remote_cmd` on `host` and return its stdout. A nonzero exit becomes a
/// process failure carrying stderr.
pub async fn run_remote(host: &dyn RemoteHost, remote_cmd: &str) -> Result<String, TransportError> {
    let out = capture(host.command(remote_cmd)).await?;
    if out.exit_code == 0 {
        Ok(out.stdout)
    } else if !out.stderr.trim().is_empty() {
        Err(TransportError::Process(out.stderr))
    } else {
        Err(TransportError::Process(format!(
            "SSH command failed: {remote_cmd}"
        )))
    }
}
