//! Connection handles and per-connection state.
//!
//! Every established socket is split in two at setup time: the loop thread
//! that serves it keeps a `mio` stream registered for read readiness, and the
//! application gets a [`ConnectionHandle`] wrapping a clone of the same socket
//! for writes and closing.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::config::SocketOptions;
use super::writer::{self, WriteOutcome};

/// Unique identifier for connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct HandleInner {
    id: ConnectionId,
    peer: SocketAddr,
    stream: TcpStream,
    closed: AtomicBool,
    write_nap: Duration,
}

/// Shared reference to one established, non-blocking socket.
///
/// Clones refer to the same socket; equality and hashing go by
/// [`ConnectionId`]. A handle stays usable after its connection is closed,
/// but every write on it is abandoned.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Applies `options` to `stream` and splits it into the application handle
    /// and the `mio` stream the serving loop registers.
    pub(crate) fn establish(
        id: ConnectionId,
        stream: TcpStream,
        options: &SocketOptions,
        write_nap: Duration,
    ) -> io::Result<(Self, mio::net::TcpStream)> {
        options.apply(&stream)?;
        let peer = stream.peer_addr()?;
        let reader = mio::net::TcpStream::from_std(stream.try_clone()?);

        let handle = Self {
            inner: Arc::new(HandleInner {
                id,
                peer,
                stream,
                closed: AtomicBool::new(false),
                write_nap,
            }),
        };
        Ok((handle, reader))
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Drains `buffer` onto the socket, blocking until every byte is written
    /// or the connection fails. `buffer` is empty afterwards.
    pub fn write(&self, buffer: &mut Vec<u8>) -> WriteOutcome {
        if self.is_closed() {
            debug!(conn = %self.inner.id, "write on closed connection dropped");
            let total = buffer.len();
            buffer.clear();
            return WriteOutcome::Abandoned { written: 0, total };
        }
        writer::write(&self.inner.stream, buffer, self.inner.write_nap)
    }

    /// Flags the handle closed. Returns true for the first caller only.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn close_socket(&self) {
        if let Err(e) = self.inner.stream.shutdown(Shutdown::Both) {
            // the peer may have torn the socket down already
            if e.kind() != io::ErrorKind::NotConnected {
                debug!(conn = %self.inner.id, error = %e, "socket shutdown failed");
            }
        }
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A connection as seen from inside `receive_data`: its handle plus the
/// attachment the application bound to it.
pub struct Connection<A> {
    handle: ConnectionHandle,
    attachment: A,
}

impl<A> Connection<A> {
    pub(crate) fn new(handle: ConnectionHandle, attachment: A) -> Self {
        Self { handle, attachment }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn attachment(&self) -> &A {
        &self.attachment
    }

    pub fn attachment_mut(&mut self) -> &mut A {
        &mut self.attachment
    }

    /// Borrows the handle and the attachment at the same time.
    pub fn split(&mut self) -> (&ConnectionHandle, &mut A) {
        (&self.handle, &mut self.attachment)
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.handle.peer_addr()
    }
}

/// Converts a stream accepted through `mio` back into a std stream.
pub(crate) fn into_std(stream: mio::net::TcpStream) -> TcpStream {
    #[cfg(unix)]
    let std_stream = {
        use std::os::unix::io::{FromRawFd, IntoRawFd};
        // SAFETY: ownership of the descriptor moves out of the mio stream
        unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) }
    };

    #[cfg(windows)]
    let std_stream = {
        use std::os::windows::io::{FromRawSocket, IntoRawSocket};
        // SAFETY: ownership of the socket moves out of the mio stream
        unsafe { TcpStream::from_raw_socket(stream.into_raw_socket()) }
    };

    std_stream
}
