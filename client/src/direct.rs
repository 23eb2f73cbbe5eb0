//! Request/response client over one WebSocket to a running worker.
//!
//! [`DirectTransport`] moves through **connecting → open → closed**. Calls
//! made while connecting are serialized into an outbound queue, which the I/O
//! task flushes in order exactly once when the handshake completes. When the
//! socket closes or errors, every pending call is rejected and the instance is
//! spent; reconnecting means constructing a new one.
//!
//! There is no per-call timeout. Clone or fetch on a big repository may take
//! minutes; callers that want a bound wrap [`DirectTransport::call`] in
//! `tokio::time::timeout`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::protocol::{decode_reply, encode_request, new_request_id, Command};

/// Rejection used for a clean close or an explicit [`DirectTransport::close`].
pub const CLOSED_MESSAGE: &str = "WebSocket connection closed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Open,
    Closed,
}

type PendingReply = oneshot::Sender<Result<Value, TransportError>>;

struct Shared {
    phase: Phase,
    pending: HashMap<String, PendingReply>,
    /// Serialized requests waiting for the handshake. Only used while
    /// `phase == Connecting`.
    queue: Vec<String>,
}

/// One WebSocket connection to a worker.
pub struct DirectTransport {
    url: String,
    shared: Arc<Mutex<Shared>>,
    out_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl DirectTransport {
    /// Start connecting to `url` (`ws://host:port/`) in the background.
    ///
    /// Returns immediately; calls made before the handshake completes are
    /// queued. Must be called from within a Tokio runtime.
    pub fn open(url: &str) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            phase: Phase::Connecting,
            pending: HashMap::new(),
            queue: Vec::new(),
        }));
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(io_task(
            url.to_string(),
            Arc::clone(&shared),
            out_rx,
            cancel.clone(),
        ));

        Self {
            url: url.to_string(),
            shared,
            out_tx,
            cancel,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn phase(&self) -> Phase {
        lock(&self.shared).phase
    }

    pub fn is_open(&self) -> bool {
        self.phase() == Phase::Open
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.shared).pending.len()
    }

    /// Send `command` with `payload` (a JSON object or `null`) and wait for
    /// the correlated reply.
    pub async fn call(&self, command: Command, payload: Value) -> Result<Value, TransportError> {
        let reply = self.submit(command, payload)?;
        reply
            .await
            .unwrap_or_else(|_| Err(TransportError::ConnectionLost(CLOSED_MESSAGE.to_string())))
    }

    /// Register the call and hand its frame to the socket (or the queue).
    fn submit(
        &self,
        command: Command,
        payload: Value,
    ) -> Result<oneshot::Receiver<Result<Value, TransportError>>, TransportError> {
        let request_id = new_request_id();
        let text = encode_request(&request_id, command, payload)?;
        let (tx, rx) = oneshot::channel();

        let mut shared = lock(&self.shared);
        match shared.phase {
            Phase::Closed => {
                return Err(TransportError::ConnectionLost(CLOSED_MESSAGE.to_string()));
            }
            Phase::Connecting => {
                shared.pending.insert(request_id, tx);
                shared.queue.push(text);
            }
            Phase::Open => {
                if self.out_tx.send(text).is_err() {
                    return Err(TransportError::ConnectionLost(CLOSED_MESSAGE.to_string()));
                }
                shared.pending.insert(request_id, tx);
            }
        }
        Ok(rx)
    }

    /// Close the connection and reject every pending call. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        fail_all(&self.shared, CLOSED_MESSAGE);
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transition to closed and reject everything still pending.
fn fail_all(shared: &Mutex<Shared>, message: &str) {
    let pending: Vec<PendingReply> = {
        let mut s = lock(shared);
        s.phase = Phase::Closed;
        s.queue.clear();
        s.pending.drain().map(|(_, tx)| tx).collect()
    };
    if !pending.is_empty() {
        debug!("Rejecting {} pending call(s): {message}", pending.len());
    }
    for tx in pending {
        let _ = tx.send(Err(TransportError::ConnectionLost(message.to_string())));
    }
}

/// Resolve the pending call a frame belongs to, if any.
fn route_reply(shared: &Mutex<Shared>, text: &str) {
    let Some(reply) = decode_reply(text) else {
        debug!("Dropping uncorrelated frame: {text}");
        return;
    };
    let waiter = lock(shared).pending.remove(&reply.request_id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(reply.outcome.map_err(TransportError::Remote));
        }
        None => debug!("Dropping reply for unknown request {}", reply.request_id),
    }
}

async fn io_task(
    url: String,
    shared: Arc<Mutex<Shared>>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        () = cancel.cancelled() => {
            fail_all(&shared, CLOSED_MESSAGE);
            return;
        }
        r = tokio_tungstenite::connect_async(url.as_str()) => r,
    };
    let ws_stream = match connected {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!("WebSocket connect to {url} failed: {e}");
            fail_all(&shared, &format!("WebSocket error: {e}"));
            return;
        }
    };
    let (mut ws_sink, mut ws_reader) = ws_stream.split();

    let queued = {
        let mut s = lock(&shared);
        if s.phase == Phase::Closed {
            return;
        }
        s.phase = Phase::Open;
        std::mem::take(&mut s.queue)
    };
    info!("Connected to {url} ({} queued call(s))", queued.len());

    for text in queued {
        if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
            fail_all(&shared, &format!("WebSocket error: {e}"));
            return;
        }
    }

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = ws_sink.close().await;
                fail_all(&shared, CLOSED_MESSAGE);
                return;
            }
            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => route_reply(&shared, text.as_str()),
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket to {url} closed");
                        fail_all(&shared, CLOSED_MESSAGE);
                        return;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket to {url} failed: {e}");
                        fail_all(&shared, &format!("WebSocket error: {e}"));
                        return;
                    }
                    _ => {} // Binary/Ping/Pong: ignore
                }
            }
            Some(text) = out_rx.recv() => {
                if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                    fail_all(&shared, &format!("WebSocket error: {e}"));
                    return;
                }
            }
        }
    }
}
