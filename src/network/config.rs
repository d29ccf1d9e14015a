use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{NetError, Result};

/// Port used when a server is not given one.
pub const DEFAULT_PORT: u16 = 10997;
/// Host used when a server is not given one.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Size of the per-loop read buffer, i.e. the largest chunk handed to `receive_data`.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 255;
/// Upper bound on one wait for write readiness inside the outbound writer.
pub const DEFAULT_WRITE_NAP: Duration = Duration::from_millis(10);
const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Socket options applied to every established connection.
///
/// `send_buffer_size` / `recv_buffer_size` map to `SO_SNDBUF` / `SO_RCVBUF`
/// and are ignored on platforms without `libc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub no_delay: bool,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            no_delay: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

impl SocketOptions {
    /// Switches `stream` to non-blocking mode and applies the options.
    pub(crate) fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(self.no_delay)?;

        // Ignore errors - not all platforms honour these
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = stream.as_raw_fd();
            if let Some(size) = self.send_buffer_size {
                set_buffer_size(fd, libc::SO_SNDBUF, size);
            }
            if let Some(size) = self.recv_buffer_size {
                set_buffer_size(fd, libc::SO_RCVBUF, size);
            }
        }

        Ok(())
    }
}

#[cfg(unix)]
fn set_buffer_size(fd: std::os::unix::io::RawFd, option: libc::c_int, size: usize) {
    let optval: libc::c_int = size.min(libc::c_int::MAX as usize) as libc::c_int;
    // SAFETY: fd is a live socket owned by the caller, optval outlives the call
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

/// Configuration for a [`Multiplexer`](crate::network::Multiplexer).
///
/// Use `ServerConfig::builder()` for ergonomic construction; unset fields fall
/// back to `ServerConfig::default()`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host name or IP address to bind to
    pub host: String,
    /// Port to bind to, 0 lets the OS pick one
    pub port: u16,
    /// Size of the shared read buffer of the read loop
    pub read_buffer_size: usize,
    /// Maximum readiness events handled per wake-up
    pub events_capacity: usize,
    /// Bound on each write-readiness wait in the outbound writer
    pub write_nap: Duration,
    /// Options for accepted sockets
    pub socket: SocketOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            write_nap: DEFAULT_WRITE_NAP,
            socket: SocketOptions::default(),
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(NetError::Configuration(
                "read_buffer_size must be greater than zero".into(),
            ));
        }
        if self.events_capacity == 0 {
            return Err(NetError::Configuration(
                "events_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn resolve(&self) -> Result<SocketAddr> {
        resolve(&self.host, self.port)
    }
}

#[derive(Default)]
pub struct ServerConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    read_buffer_size: Option<usize>,
    events_capacity: Option<usize>,
    write_nap: Option<Duration>,
    socket: Option<SocketOptions>,
}

impl ServerConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = Some(size);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn write_nap(mut self, nap: Duration) -> Self {
        self.write_nap = Some(nap);
        self
    }

    pub fn socket(mut self, socket: SocketOptions) -> Self {
        self.socket = Some(socket);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            host: self.host.unwrap_or(default.host),
            port: self.port.unwrap_or(default.port),
            read_buffer_size: self.read_buffer_size.unwrap_or(default.read_buffer_size),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            write_nap: self.write_nap.unwrap_or(default.write_nap),
            socket: self.socket.unwrap_or(default.socket),
        }
    }
}

/// Configuration for a [`PeerConnection`](crate::network::PeerConnection).
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub read_buffer_size: usize,
    pub write_nap: Duration,
    pub socket: SocketOptions,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            write_nap: DEFAULT_WRITE_NAP,
            socket: SocketOptions::default(),
        }
    }
}

impl PeerConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(NetError::Configuration(
                "read_buffer_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Resolves `host:port` to the first address the resolver returns.
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let unresolved = || NetError::HostResolution {
        host: host.to_string(),
        port,
    };
    (host, port)
        .to_socket_addrs()
        .map_err(|_| unresolved())?
        .next()
        .ok_or_else(unresolved)
}
