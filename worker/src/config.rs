//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `PORT`, `ONESHOT`, `GITYAK_HOST`
//! 2. **Config file**: path via `--config <path>`, or `gityak.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 0                      # 0 = OS-assigned
//! oneshot = false               # exit when heartbeats stop
//! heartbeat_timeout_secs = 30
//! heartbeat_check_secs = 5
//!
//! [git]
//! program = "git"
//! lock_retries = 3
//! lock_retry_delay_ms = 100
//!
//! [agent]
//! agent_program = "ssh-agent"
//! add_program = "ssh-add"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and oneshot-mode settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind (default `127.0.0.1`). Override with `GITYAK_HOST`.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind, `0` for an OS-assigned port. Override with `PORT`.
    #[serde(default)]
    pub port: u16,
    /// Self-terminate when no heartbeat arrives within
    /// `heartbeat_timeout_secs`. Override with `ONESHOT=1`.
    #[serde(default)]
    pub oneshot: bool,
    /// Seconds without a heartbeat before a oneshot worker exits (default 30).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Seconds between watchdog checks (default 5).
    #[serde(default = "default_heartbeat_check")]
    pub heartbeat_check_secs: u64,
}

/// Git invocation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    /// Git executable (default `git`, resolved through `PATH`).
    #[serde(default = "default_git_program")]
    pub program: String,
    /// Extra attempts when the index lock is held by another process (default 3).
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,
    /// Delay before the first lock retry, doubled on each attempt (default 100 ms).
    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,
}

/// Credential agent programs.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_program")]
    pub agent_program: String,
    #[serde(default = "default_add_program")]
    pub add_program: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_heartbeat_timeout() -> u64 {
    30
}
fn default_heartbeat_check() -> u64 {
    5
}
fn default_git_program() -> String {
    "git".to_string()
}
fn default_lock_retries() -> u32 {
    3
}
fn default_lock_retry_delay_ms() -> u64 {
    100
}
fn default_agent_program() -> String {
    "ssh-agent".to_string()
}
fn default_add_program() -> String {
    "ssh-add".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: 0,
            oneshot: false,
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            heartbeat_check_secs: default_heartbeat_check(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            program: default_git_program(),
            lock_retries: default_lock_retries(),
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_program: default_agent_program(),
            add_program: default_add_program(),
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

impl ServerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn heartbeat_check(&self) -> Duration {
        Duration::from_secs(self.heartbeat_check_secs.max(1))
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `gityak.toml`
    /// in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else if Path::new("gityak.toml").exists() {
            Self::from_file(Path::new("gityak.toml"))?
        } else {
            Config::default()
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

    /// Apply the worker's startup environment contract (`PORT`, `ONESHOT`)
    /// plus `GITYAK_HOST` on top of file/default values.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), String> {
        if let Some(port) = var("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|_| format!("Invalid PORT value: {port:?}"))?;
        }
        if let Some(oneshot) = var("ONESHOT") {
            self.server.oneshot = matches!(oneshot.trim(), "1" | "true");
        }
        if let Some(host) = var("GITYAK_HOST") {
            self.server.host = host;
        }
        Ok(())
    }
}
