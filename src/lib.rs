//! lineserve - line-oriented TCP servers and clients
//!
//! Architecture:
//! - Readiness-based: one `mio` poll per loop thread, edge-triggered reads
//! - Split roles: an accept thread hands sockets to a single read thread
//!   through a lock-free SPSC queue
//! - Blocking writes: callers drain whole buffers onto non-blocking sockets
//! - Line framing lives above the core, in `protocol` and `chat`

pub mod chat;
pub mod core;
pub mod error;
pub mod network;
pub mod protocol;

pub use error::{NetError, Result};
pub use network::{
    Connection, ConnectionHandle, ConnectionId, Multiplexer, PeerConfig, PeerConnection,
    ServerConfig, ServerControl, ServerHandle, ServerHandler, ServerListener, WriteOutcome,
};
