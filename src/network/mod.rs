//! Network Layer: readiness-based, non-blocking TCP
//!
//! Uses mio for cross-platform readiness notification (epoll/kqueue/IOCP).
//!
//! - `server`: connection multiplexer with accept and read loops
//! - `peer`: single outbound connection with its own read loop
//! - `writer`: blocking drain of a buffer onto a non-blocking socket
//! - `listener`: callback contract for inbound data and disconnects

pub mod config;
mod connection;
mod listener;
mod peer;
mod server;
pub mod writer;

pub use config::{PeerConfig, ServerConfig, ServerConfigBuilder, SocketOptions};
pub use connection::{Connection, ConnectionHandle, ConnectionId};
pub use listener::ServerListener;
pub use peer::PeerConnection;
pub use server::{Multiplexer, ServerControl, ServerHandle, ServerHandler};
pub use writer::WriteOutcome;
