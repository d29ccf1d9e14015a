//! Client side: one outbound connection driven by a private readiness loop.
//!
//! ```text
//!   caller thread                      loop thread
//!   ─────────────                      ───────────
//!   connect() ──spawn──────────────▶   poll(READABLE | waker)
//!   write()   ──▶ outbound writer        read until WouldBlock
//!   disconnect()                           └─▶ listener.receive_data()
//!     ├─ listener.disconnected()         EOF / error ─▶ disconnect()
//!     ├─ shutdown socket
//!     └─ wake + join ────────────────▶   exit
//! ```
//!
//! Delivery and disconnect are serialised by a re-entrant lock, so a listener
//! may call `disconnect()` from inside `receive_data`.

use std::io::{self, Read};
use std::marker::PhantomData;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, info, warn};

use super::config::{self, PeerConfig};
use super::connection::{Connection, ConnectionHandle, ConnectionId};
use super::listener::ServerListener;
use super::writer::WriteOutcome;
use crate::error::{NetError, Result};

const STREAM_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const EVENTS_CAPACITY: usize = 16;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// State of one connect/disconnect cycle.
struct Session<A, L> {
    handle: ConnectionHandle,
    listener: Arc<L>,
    running: AtomicBool,
    delivery: ReentrantMutex<()>,
    waker: Waker,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
    _attachment: PhantomData<fn(A)>,
}

impl<A, L: ServerListener<A>> Session<A, L> {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn disconnect(&self) -> Result<()> {
        {
            let _delivery = self.delivery.lock();
            if self
                .running
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(NetError::InvalidState("not connected to any server"));
            }

            self.listener.disconnected();
            self.handle.mark_closed();
            self.handle.close_socket();
        }

        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "failed to wake peer loop");
        }

        let loop_thread = self.loop_thread.lock().take();
        if let Some(loop_thread) = loop_thread {
            // a disconnect from inside a callback cannot join its own thread
            if loop_thread.thread().id() != thread::current().id() && loop_thread.join().is_err() {
                warn!(conn = %self.handle.id(), "peer loop thread panicked");
            }
        }

        info!(conn = %self.handle.id(), peer = %self.handle.peer_addr(), "disconnected");
        Ok(())
    }
}

fn run_loop<A, L: ServerListener<A>>(
    session: Arc<Session<A, L>>,
    mut poll: Poll,
    mut stream: mio::net::TcpStream,
    attachment: A,
    buffer_size: usize,
) {
    let mut conn = Connection::new(session.handle.clone(), attachment);
    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    let mut buffer = vec![0u8; buffer_size];

    'outer: while session.is_running() {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %e, "peer readiness wait failed");
            let _ = session.disconnect();
            break;
        }

        for event in events.iter() {
            if event.token() != STREAM_TOKEN {
                continue;
            }

            // edge-triggered: drain until the socket would block
            loop {
                let _delivery = session.delivery.lock();
                if !session.is_running() {
                    break 'outer;
                }

                match stream.read(&mut buffer) {
                    Ok(0) => {
                        debug!(conn = %conn.id(), "server closed the connection");
                        let _ = session.disconnect();
                        break 'outer;
                    }
                    Ok(n) => session.listener.receive_data(&mut conn, n, &buffer[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(conn = %conn.id(), error = %e, "read failed");
                        let _ = session.disconnect();
                        break 'outer;
                    }
                }
            }
        }
    }

    if let Err(e) = poll.registry().deregister(&mut stream) {
        debug!(error = %e, "deregister failed");
    }
    debug!(conn = %conn.id(), "peer loop stopped");
}

/// One outbound connection to a server.
///
/// A `PeerConnection` serves one connection at a time and can connect again
/// after a disconnect. Dropping a connected `PeerConnection` disconnects it.
pub struct PeerConnection<A: Send + 'static, L: ServerListener<A>> {
    listener: Arc<L>,
    config: PeerConfig,
    session: Mutex<Option<Arc<Session<A, L>>>>,
}

impl<A: Send + 'static, L: ServerListener<A>> PeerConnection<A, L> {
    pub fn new(listener: L) -> Self {
        Self::with_config(listener, PeerConfig::default())
    }

    pub fn with_config(listener: L, config: PeerConfig) -> Self {
        Self {
            listener: Arc::new(listener),
            config,
            session: Mutex::new(None),
        }
    }

    pub fn listener(&self) -> &Arc<L> {
        &self.listener
    }

    /// Connects to `host:port`, binding `attachment` to the new connection,
    /// and starts the readiness loop thread.
    ///
    /// Fails with [`NetError::InvalidState`] while a connection is live, and
    /// leaves that connection untouched.
    pub fn connect(&self, host: &str, port: u16, attachment: A) -> Result<()> {
        let mut slot = self.session.lock();
        if slot.as_ref().is_some_and(|s| s.is_running()) {
            return Err(NetError::InvalidState(
                "already connected to a server; call disconnect() first",
            ));
        }
        self.config.validate()?;

        let addr = config::resolve(host, port)?;
        let stream = TcpStream::connect(addr)?;

        let id = ConnectionId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed));
        let (handle, mut reader) = ConnectionHandle::establish(
            id,
            stream,
            &self.config.socket,
            self.config.write_nap,
        )?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut reader, STREAM_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let session = Arc::new(Session {
            handle,
            listener: self.listener.clone(),
            running: AtomicBool::new(true),
            delivery: ReentrantMutex::new(()),
            waker,
            loop_thread: Mutex::new(None),
            _attachment: PhantomData,
        });

        let loop_session = session.clone();
        let buffer_size = self.config.read_buffer_size;
        let loop_thread = thread::Builder::new()
            .name(format!("lineserve-peer-{}", id.as_u64()))
            .spawn(move || run_loop(loop_session, poll, reader, attachment, buffer_size))?;
        *session.loop_thread.lock() = Some(loop_thread);

        info!(conn = %id, %addr, "connected");
        *slot = Some(session);
        Ok(())
    }

    /// Notifies the listener, then closes the socket and stops the loop thread.
    ///
    /// Safe to call from any thread, including from inside a listener
    /// callback. Fails with [`NetError::InvalidState`] when not connected.
    pub fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().clone();
        match session {
            Some(session) => session.disconnect(),
            None => Err(NetError::InvalidState("not connected to any server")),
        }
    }

    /// Drains `buffer` onto the connection; see [`writer::write`](super::writer::write).
    ///
    /// Must not run concurrently with another write on the same connection.
    pub fn write(&self, buffer: &mut Vec<u8>) -> WriteOutcome {
        let handle = self.session.lock().as_ref().map(|s| s.handle.clone());
        match handle {
            Some(handle) => handle.write(buffer),
            None => {
                warn!("write while not connected dropped");
                let total = buffer.len();
                buffer.clear();
                WriteOutcome::Abandoned { written: 0, total }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().as_ref().is_some_and(|s| s.is_running())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session
            .lock()
            .as_ref()
            .filter(|s| s.is_running())
            .map(|s| s.handle.peer_addr())
    }
}

impl<A: Send + 'static, L: ServerListener<A>> Drop for PeerConnection<A, L> {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            if session.is_running() {
                let _ = session.disconnect();
            }
        }
    }
}
