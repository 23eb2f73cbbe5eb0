#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! Client transports for the gityak worker.
//!
//! ```text
//! protocol.rs : envelope encoding, reply decoding, request ids
//! direct.rs   : request/response over one WebSocket
//! remote.rs   : ssh/scp command construction (RemoteHost, OpenSsh)
//! tunnel.rs   : provision, launch, forward and supervise a remote worker
//! ssh.rs      : worker-less transport, one ssh exec per call
//! transport.rs: Connection facade and typed helpers
//! config.rs   : TOML / env configuration
//! ```

pub mod config;
pub mod direct;
pub mod error;
pub mod protocol;
pub mod remote;
pub mod ssh;
pub mod transport;
pub mod tunnel;

pub use config::ClientConfig;
pub use direct::DirectTransport;
pub use error::TransportError;
pub use protocol::Command;
pub use remote::{OpenSsh, RemoteHost};
pub use transport::{Connection, DirListing, Transport};
pub use tunnel::{ConnectionPhase, TunnelManager, TunnelOptions};
