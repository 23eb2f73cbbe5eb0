//! Error type shared by every transport.

/// Why a call (or a connect) did not produce data.
///
/// `Clone` so a single connection loss can reject every pending caller with
/// the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The socket closed or errored while the call was pending, or before it
    /// could be sent.
    ConnectionLost(String),
    /// No transport is active.
    NotConnected,
    /// The worker (or the remote tool) replied with an error message.
    Remote(String),
    /// A request or reply could not be encoded/decoded.
    InvalidPayload(String),
    /// A local helper process (ssh, scp, the remote worker) failed.
    Process(String),
    /// The remote worker did not announce itself in time.
    Timeout(String),
    Io(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::ConnectionLost(msg)
            | TransportError::Remote(msg)
            | TransportError::Process(msg)
            | TransportError::Timeout(msg) => f.write_str(msg),
            TransportError::NotConnected => write!(f, "Not connected"),
            TransportError::InvalidPayload(msg) => write!(f, "Invalid payload: {msg}"),
            TransportError::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}
