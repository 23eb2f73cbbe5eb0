#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # gityak
//!
//! Remote Git worker. A client either connects to a long-running instance
//! directly, or uploads this binary over SSH, launches it in oneshot mode and
//! reaches it through a local port forward.
//!
//! ## Startup contract
//!
//! - `gityak --version` prints the bare version and exits 0.
//! - `PORT` selects the port (`0` = OS-assigned), `ONESHOT=1` enables the
//!   heartbeat watchdog.
//! - Once bound, exactly one line `SERVER_READY|PORT:<port>` is written to
//!   stdout. Logs go to stderr.
//!
//! ## API surface
//!
//! | Method | Path          | Description                          |
//! |--------|---------------|--------------------------------------|
//! | GET    | `/`           | WebSocket command channel            |
//! | GET    | `/api/health` | Liveness check                       |

use std::io::Write;

use clap::Parser;
use gityak_worker::{ready_line, serve, AppState, Config, WORKER_VERSION};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "gityak", about = "Remote Git worker", disable_version_flag = true)]
struct Cli {
    /// Print the worker version and exit
    #[arg(long)]
    version: bool,

    /// Path to config file
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("{WORKER_VERSION}");
        return;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("gityak: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(config).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), String> {
    info!("gityak v{WORKER_VERSION} starting");

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .map_err(|e| {
            format!(
                "Failed to bind {}:{}: {e}",
                config.server.host, config.server.port
            )
        })?;
    let port = listener
        .local_addr()
        .map_err(|e| format!("Failed to read bound address: {e}"))?
        .port();

    let state = AppState::new(config);

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", ready_line(port))
            .and_then(|()| stdout.flush())
            .map_err(|e| format!("Failed to announce port: {e}"))?;
    }
    info!("Listening on {}:{port}", state.config.server.host);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_token.cancel();
    });

    let served = serve(listener, state, shutdown).await;
    info!("Goodbye");
    served.map_err(|e| format!("Server error: {e}"))
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to register SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received SIGINT");
    }
}
