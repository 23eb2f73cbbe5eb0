//! # gityak-client
//!
//! Run one worker command from the shell, over any transport:
//!
//! ```text
//! gityak-client --url ws://127.0.0.1:7777/ git --repo ~/src/app -- status --porcelain
//! gityak-client --ssh dev@build:2222 read --repo /srv/app README.md
//! gityak-client --ssh dev@build --plain write --repo /srv/app notes.txt --content hi
//! ```
//!
//! Without `--url` or `--ssh`, the destination comes from the config file or
//! `GITYAK_URL` / `GITYAK_SSH_HOST`. `--ssh` uploads and launches a worker
//! through a tunnel unless `--plain` asks for plain SSH exec.

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use gityak_client::config::{expand_tilde, parse_destination};
use gityak_client::{ClientConfig, Connection, OpenSsh, TransportError, TunnelManager};
use tracing::info;

#[derive(Parser)]
#[command(name = "gityak-client", about = "Run Git and file commands on a gityak worker", version)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Worker WebSocket URL (direct mode)
    #[arg(long, global = true, conflicts_with = "ssh")]
    url: Option<String>,

    /// SSH destination, user@host[:port]
    #[arg(long, global = true)]
    ssh: Option<String>,

    /// SSH private key
    #[arg(long, global = true)]
    key: Option<PathBuf>,

    /// Run commands over plain SSH instead of a tunneled worker
    #[arg(long, global = true)]
    plain: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run git in a repository and print its output
    Git {
        #[arg(long)]
        repo: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
    /// Print a file from a repository
    Read {
        #[arg(long)]
        repo: String,
        file: String,
        /// Print nothing instead of failing when the file is missing
        #[arg(long)]
        null_if_missing: bool,
    },
    /// Write a file in a repository
    Write {
        #[arg(long)]
        repo: String,
        file: String,
        #[arg(long)]
        content: String,
        /// Create parent directories first
        #[arg(long)]
        mkdir: bool,
    },
    /// List a directory on the worker host
    Browse { path: String },
    /// Send a heartbeat and report the round trip
    Ping,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match ClientConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("gityak-client: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let mut conn = Connection::new();
    let outcome = match connect(&cli, &config, &mut conn).await {
        Ok(()) => run(&conn, cli.command).await,
        Err(e) => Err(e),
    };
    conn.disconnect().await;

    if let Err(e) = outcome {
        eprintln!("gityak-client: {e}");
        std::process::exit(1);
    }
}

async fn connect(cli: &Cli, config: &ClientConfig, conn: &mut Connection) -> Result<(), String> {
    if let Some(url) = cli.url.as_ref().or(if cli.ssh.is_none() {
        config.url.as_ref()
    } else {
        None
    }) {
        conn.connect_direct(url).await;
        return Ok(());
    }

    let (user, host, port) = match &cli.ssh {
        Some(dest) => parse_destination(dest, config.remote.port)?,
        None => {
            let host = config
                .remote
                .host
                .clone()
                .ok_or("No destination: pass --url or --ssh, or configure one")?;
            let user = config
                .remote
                .user
                .clone()
                .ok_or("No SSH user configured")?;
            (user, host, config.remote.port)
        }
    };
    let key = cli
        .key
        .clone()
        .or_else(|| config.remote.key_path.clone())
        .map(|k| expand_tilde(&k));
    let ssh = OpenSsh::new(&host, port, &user, key);

    if cli.plain {
        conn.connect_ssh(ssh.with_control_master()).await;
        return Ok(());
    }

    let manager = TunnelManager::new(ssh, config.tunnel.options()?);
    let mut phases = manager.subscribe();
    let progress = tokio::spawn(async move {
        while phases.changed().await.is_ok() {
            info!("{}", *phases.borrow_and_update());
        }
    });
    let result = conn.connect_tunnel(manager).await;
    progress.abort();
    result.map_err(|e| e.to_string())
}

async fn run(conn: &Connection, command: Cmd) -> Result<(), String> {
    match command {
        Cmd::Git { repo, args } => {
            print!("{}", conn.git(&repo, args.as_slice()).await.map_err(text)?);
        }
        Cmd::Read {
            repo,
            file,
            null_if_missing,
        } => {
            if let Some(content) = conn
                .read_file(&repo, &file, null_if_missing)
                .await
                .map_err(text)?
            {
                print!("{content}");
            }
        }
        Cmd::Write {
            repo,
            file,
            content,
            mkdir,
        } => {
            conn.write_file(&repo, &file, &content, mkdir)
                .await
                .map_err(text)?;
        }
        Cmd::Browse { path } => {
            let listing = conn.browse(&path).await.map_err(text)?;
            println!("{}", listing.path);
            for entry in listing.entries {
                let suffix = if entry.is_directory { "/" } else { "" };
                println!("  {}{suffix}", entry.name);
            }
        }
        Cmd::Ping => {
            let started = Instant::now();
            conn.heartbeat().await.map_err(text)?;
            println!("ok ({} ms)", started.elapsed().as_millis());
        }
    }
    Ok(())
}

fn text(e: TransportError) -> String {
    e.to_string()
}
