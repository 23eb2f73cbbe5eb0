//! WebSocket transport and command dispatch.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /`. The worker only binds loopback by default
//!    and is reached through an SSH port forward, so there is no token.
//! 2. The worker sends one uncorrelated greeting,
//!    `{"type": "hello", "message": "gityak worker ready"}`.
//! 3. Every inbound frame is a JSON envelope `{requestId, command, ...}`; every
//!    reply echoes `requestId` (see [`crate::envelope`]).
//! 4. On disconnect, the connection's in-flight command is aborted (its child
//!    process is killed on drop). Once the executor has stopped, the
//!    connection's ssh-agent session is destroyed.
//!
//! ## Commands
//!
//! | Command        | Fields                                              | `data` on success          |
//! |----------------|-----------------------------------------------------|----------------------------|
//! | `gitCall`      | `repo_path`, `args[]`                               | stdout (string)            |
//! | `readFile`     | `repo_path`, `file_path`, `options.nullIfNotExists?`| content (string) or `null` |
//! | `writeFile`    | `repo_path`, `file_path`, `content`, `options.makeDirectory?` | -                |
//! | `browseFiles`  | `path?` (absolute, default `/`)                     | `{path, entries[]}`        |
//! | `sshAgentInit` | `privateKey`                                        | -                          |
//! | `heartbeat`    | -                                                   | -                          |
//!
//! ## Ordering
//!
//! `heartbeat` is answered directly by the read loop so a long-running git
//! command can never starve liveness. Everything else is queued to a
//! per-connection executor that runs one command at a time, in arrival order.
//! Each command runs in its own task; a panic becomes a
//! `"Failed to process message"` reply and the connection stays up.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::agent::ConnectionId;
use crate::commands::{browse, files, git, required_str, CommandError};
use crate::envelope::{self, Command};
use crate::AppState;

/// Greeting sent once per connection, before any reply.
pub const HELLO_MESSAGE: &str = "gityak worker ready";

/// `GET /`: WebSocket upgrade handler.
pub async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Drive one WebSocket connection until the client goes away.
///
/// Outgoing frames are funneled through an mpsc channel into a dedicated sink
/// task, so the read loop and the executor can both reply without sharing the
/// socket.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let conn = ConnectionId::new();
    info!("Client connected ({conn})");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Value>(256);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("WS send: failed to serialize message: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = tx
        .send(json!({"type": "hello", "message": HELLO_MESSAGE}))
        .await;

    let (work_tx, work_rx) = mpsc::unbounded_channel::<Value>();
    let cancel = CancellationToken::new();
    let executor = tokio::spawn(executor_task(
        state.clone(),
        conn,
        work_rx,
        tx.clone(),
        cancel.clone(),
    ));

    while let Some(Ok(msg)) = ws_stream.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let parsed = match serde_json::from_str::<Value>(&text) {
            Ok(v) => v,
            Err(e) => {
                debug!("Unparseable frame from {conn}: {e}");
                let _ = tx.send(envelope::failure(&Value::Null, e.to_string())).await;
                continue;
            }
        };

        if parsed.get("command").and_then(Value::as_str) == Some(Command::Heartbeat.as_str()) {
            let resp = dispatch(state.clone(), conn, parsed).await;
            let _ = tx.send(resp).await;
        } else if work_tx.send(parsed).is_err() {
            break;
        }
    }

    info!("Client disconnected ({conn})");
    drop(work_tx);
    cancel.cancel();
    // An init racing the close may still insert a session; wait it out.
    if let Err(e) = executor.await {
        error!("Executor for {conn} failed: {e}");
    }
    state.agents.destroy_agent(conn).await;
    send_task.abort();
}

/// Run queued commands for one connection, one at a time, until `cancel`
/// fires. A command still running at that point is aborted and awaited.
async fn executor_task(
    state: AppState,
    conn: ConnectionId,
    mut work_rx: mpsc::UnboundedReceiver<Value>,
    tx: mpsc::Sender<Value>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = work_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let request_id = envelope::request_id(&msg);
        let mut task = tokio::spawn(dispatch(state.clone(), conn, msg));
        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = cancel.cancelled() => {
                task.abort();
                if let Err(e) = task.await {
                    debug!("Aborted in-flight command on {conn}: {}", join_error_details(e));
                }
                break;
            }
        };
        let resp = match joined {
            Ok(resp) => resp,
            Err(e) => {
                let details = join_error_details(e);
                error!("Command handler failed on {conn}: {details}");
                envelope::failure(&request_id, details)
            }
        };
        if tx.send(resp).await.is_err() {
            break;
        }
    }
}

fn join_error_details(e: JoinError) -> String {
    if e.is_cancelled() {
        return "command cancelled".to_string();
    }
    let payload = e.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "command handler panicked".to_string()
    }
}

/// Execute one envelope and build its reply.
pub async fn dispatch(state: AppState, conn: ConnectionId, msg: Value) -> Value {
    let request_id = envelope::request_id(&msg);
    let name = match msg.get("command") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "undefined".to_string(),
    };
    let Some(command) = Command::from_name(&name) else {
        debug!("Unknown command {name:?} from {conn}");
        return envelope::error(&request_id, format!("Unknown command: {name}"));
    };

    let result = match command {
        Command::Heartbeat => {
            state.liveness.touch();
            Ok(None)
        }
        Command::GitCall => {
            let env = state.agents.agent_env(conn).await;
            git::git_call(&state.config.git, &msg, &env).await.map(Some)
        }
        Command::ReadFile => files::read_file(&msg).await.map(Some),
        Command::WriteFile => files::write_file(&msg).await.map(|()| None),
        Command::BrowseFiles => browse::browse_files(&msg).await.map(Some),
        Command::SshAgentInit => ssh_agent_init(&state, conn, &msg).await.map(|()| None),
    };

    match result {
        Ok(data) => envelope::success(&request_id, data),
        Err(e) => {
            debug!("{} failed on {conn}: {e}", command.as_str());
            envelope::error(&request_id, e.to_string())
        }
    }
}

async fn ssh_agent_init(
    state: &AppState,
    conn: ConnectionId,
    msg: &Value,
) -> Result<(), CommandError> {
    let key = required_str(msg, "privateKey")?;
    state.agents.init_agent(conn, key).await?;
    Ok(())
}
