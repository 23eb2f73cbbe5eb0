#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]

//! gityak worker library: the pieces behind the `gityak` binary.
//!
//! - `envelope`: request/reply envelope helpers
//! - `ws`: WebSocket upgrade, per-connection executor, command dispatch
//! - `commands`: gitCall, readFile/writeFile, browseFiles handlers
//! - `agent`: per-connection ssh-agent sessions
//! - `liveness`: heartbeat tracking and the oneshot watchdog
//! - `process`: child process spawning and output capture
//! - `config`: configuration loading

pub mod agent;
pub mod commands;
pub mod config;
pub mod envelope;
pub mod liveness;
pub mod process;
pub mod routes;
pub mod state;
pub mod util;
pub mod ws;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use config::Config;
pub use state::AppState;

/// Version reported by `--version` and compared by clients during provisioning.
pub const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix of the single stdout line announcing the bound port.
pub const READY_PREFIX: &str = "SERVER_READY|PORT:";

/// Build the worker's router: WebSocket at `/`, health check at `/api/health`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws::ws_upgrade))
        .route("/api/health", get(routes::health::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The ready line printed once the listener is bound.
pub fn ready_line(port: u16) -> String {
    format!("{READY_PREFIX}{port}")
}

/// Serve `state` on `listener` until `shutdown` fires or, in oneshot mode,
/// heartbeats stop. Agent sessions are destroyed before returning.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let watchdog_task = if state.config.server.oneshot {
        info!(
            "Oneshot mode: exiting after {}s without a heartbeat",
            state.config.server.heartbeat_timeout_secs
        );
        let token = shutdown.clone();
        let liveness = state.liveness.clone();
        let timeout = state.config.server.heartbeat_timeout();
        let check = state.config.server.heartbeat_check();
        Some(tokio::spawn(async move {
            liveness::watchdog(liveness, timeout, check).await;
            token.cancel();
        }))
    } else {
        None
    };

    let served = axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    // Cleanup
    info!("Shutting down...");
    if let Some(task) = watchdog_task {
        task.abort();
    }
    state.agents.destroy_all().await;
    served
}
