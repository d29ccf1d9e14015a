use std::io;
use std::net::SocketAddr;

pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// startup errors
    #[error("cannot resolve host {host}:{port}")]
    HostResolution { host: String, port: u16 },

    #[error("cannot bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// runtime errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("illegal state: {0}")]
    InvalidState(&'static str),

    #[error("{0} thread panicked")]
    LoopPanicked(&'static str),
}

impl NetError {
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, NetError::InvalidState(_))
    }
}
