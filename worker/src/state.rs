//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::agent::AgentSessions;
use crate::config::Config;
use crate::liveness::Liveness;

/// Shared application state for the worker.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the worker started (for uptime calculation).
    pub start_time: Instant,
    /// Last heartbeat, read by the oneshot watchdog.
    pub liveness: Liveness,
    /// ssh-agent sessions keyed by connection.
    pub agents: AgentSessions,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let agents = AgentSessions::new(&config.agent);
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            liveness: Liveness::new(),
            agents,
        }
    }
}
