//! Client configuration.
//!
//! Precedence, highest first: environment variables, the TOML file
//! (`--config <path>` or `gityak-client.toml` in the current directory),
//! compiled defaults. Command-line flags are applied on top by the binary.
//!
//! ```toml
//! url = "ws://127.0.0.1:7777/"   # direct mode
//!
//! [remote]                      # tunnel / plain SSH mode
//! host = "build.example.com"
//! port = 22
//! user = "dev"
//! key_path = "~/.ssh/id_ed25519"
//!
//! [tunnel]
//! worker_binary = "/opt/gityak/gityak"
//! worker_version = "1.0.0"
//! launch_timeout_secs = 15
//! settle_delay_ms = 800
//! heartbeat_interval_secs = 10
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::WORKER_VERSION;
use crate::tunnel::TunnelOptions;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Worker URL for direct mode. Override with `GITYAK_URL`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SSH destination.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// `GITYAK_SSH_HOST`
    #[serde(default)]
    pub host: Option<String>,
    /// `GITYAK_SSH_PORT` (default 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// `GITYAK_SSH_USER`, falling back to `$USER`
    #[serde(default)]
    pub user: Option<String>,
    /// `GITYAK_SSH_KEY`. A leading `~/` is expanded.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Local worker binary to upload. Override with `GITYAK_WORKER_BINARY`.
    /// Defaults to `gityak` next to this executable.
    #[serde(default)]
    pub worker_binary: Option<PathBuf>,
    #[serde(default = "default_worker_version")]
    pub worker_version: String,
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_ssh_port() -> u16 {
    22
}
fn default_worker_version() -> String {
    WORKER_VERSION.to_string()
}
fn default_launch_timeout() -> u64 {
    15
}
fn default_settle_delay() -> u64 {
    800
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_ssh_port(),
            user: None,
            key_path: None,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            worker_binary: None,
            worker_version: default_worker_version(),
            launch_timeout_secs: default_launch_timeout(),
            settle_delay_ms: default_settle_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TunnelConfig {
    /// Resolve into manager options. Fails only when no worker binary is
    /// configured and the executable's own directory cannot be determined.
    pub fn options(&self) -> Result<TunnelOptions, String> {
        let worker_binary = match &self.worker_binary {
            Some(p) => expand_tilde(p),
            None => default_worker_binary()?,
        };
        let mut options = TunnelOptions::new(worker_binary);
        options.worker_version.clone_from(&self.worker_version);
        options.launch_timeout = Duration::from_secs(self.launch_timeout_secs);
        options.settle_delay = Duration::from_millis(self.settle_delay_ms);
        options.heartbeat_interval = Duration::from_secs(self.heartbeat_interval_secs.max(1));
        Ok(options)
    }
}

fn default_worker_binary() -> Result<PathBuf, String> {
    let exe = std::env::current_exe()
        .map_err(|e| format!("Cannot locate the worker binary: {e}"))?;
    let dir = exe
        .parent()
        .ok_or_else(|| format!("Cannot locate the worker binary next to {}", exe.display()))?;
    Ok(dir.join("gityak"))
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

impl ClientConfig {
    /// Load with env vars > file > defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            Self::from_file(p)?
        } else if Path::new("gityak-client.toml").exists() {
            Self::from_file(Path::new("gityak-client.toml"))?
        } else {
            ClientConfig::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {e}", path.display()))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), String> {
        if let Some(url) = var("GITYAK_URL") {
            self.url = Some(url);
        }
        if let Some(host) = var("GITYAK_SSH_HOST") {
            self.remote.host = Some(host);
        }
        if let Some(user) = var("GITYAK_SSH_USER") {
            self.remote.user = Some(user);
        }
        if let Some(port) = var("GITYAK_SSH_PORT") {
            self.remote.port = port
                .trim()
                .parse()
                .map_err(|_| format!("Invalid GITYAK_SSH_PORT value: {port:?}"))?;
        }
        if let Some(key) = var("GITYAK_SSH_KEY") {
            self.remote.key_path = Some(PathBuf::from(key));
        }
        if let Some(binary) = var("GITYAK_WORKER_BINARY") {
            self.tunnel.worker_binary = Some(PathBuf::from(binary));
        }
        if self.remote.user.is_none() {
            self.remote.user = var("USER");
        }
        Ok(())
    }
}

/// Parse `user@host[:port]`. Port defaults to `default_port`.
pub fn parse_destination(dest: &str, default_port: u16) -> Result<(String, String, u16), String> {
    let (user, rest) = dest
        .split_once('@')
        .ok_or_else(|| format!("Expected user@host[:port], got {dest:?}"))?;
    if user.is_empty() {
        return Err(format!("Missing user in {dest:?}"));
    }
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (
            host,
            port.parse()
                .map_err(|_| format!("Invalid port in {dest:?}"))?,
        ),
        None => (rest, default_port),
    };
    if host.is_empty() {
        return Err(format!("Missing host in {dest:?}"));
    }
    Ok((user.to_string(), host.to_string(), port))
}
