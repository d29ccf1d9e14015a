//! Server side: listening socket, accept loop and read loop.
//!
//! ```text
//!   accept thread                         read thread
//!   ─────────────                         ───────────
//!   poll(listener | waker)                poll(connections | waker)
//!     accept()                              read into shared scratch buffer
//!     get_attachment()                        ├─ n > 0  ─▶ receive_data()
//!     new_client()                            └─ EOF/err ─▶ close ─▶ disconnection()
//!     push ─▶ [SPSC hand-off] ─▶ wake ─▶    register pending connections
//!                                           reap close_channel() requests
//!
//!   calling thread: console lines ─▶ receive_console()
//! ```
//!
//! The read loop owns every accepted connection and is the only thread that
//! delivers `receive_data` and `disconnection`. Its scratch buffer is shared
//! by all connections, which is only sound because exactly one thread runs the
//! read loop: a parallel read loop must give each worker its own buffer.

use std::collections::HashMap;
use std::io::{self, BufRead, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::config::ServerConfig;
use super::connection::{self, Connection, ConnectionHandle, ConnectionId};
use crate::core::{self as queue, Consumer, Producer};
use crate::error::{NetError, Result};

const LISTENER_TOKEN: Token = Token(0);
const ACCEPT_WAKER_TOKEN: Token = Token(1);
// connection tokens start at 1
const READ_WAKER_TOKEN: Token = Token(0);
const HANDOFF_CAPACITY: usize = 1024;

/// Hooks a concrete server implements.
///
/// `get_attachment` and `new_client` run on the accept thread,
/// `receive_data` and `disconnection` on the read thread, `receive_console` on
/// the thread that called [`Multiplexer::run`], and `init` once before any of
/// them. For a given connection `new_client` comes first, `disconnection`
/// comes last and exactly once, and `receive_data` calls never overlap.
pub trait ServerHandler: Send + Sync + 'static {
    /// Per-connection state handed back on every `receive_data`.
    type Attachment: Send + 'static;

    fn init(&self, _ctl: &ServerControl) {}

    /// Produces the attachment of a newly accepted connection.
    fn get_attachment(&self) -> Self::Attachment;

    fn new_client(&self, ctl: &ServerControl, handle: &ConnectionHandle);

    /// The connection is closed; remove it from any registry kept for it.
    fn disconnection(&self, ctl: &ServerControl, handle: &ConnectionHandle);

    /// `data` borrows the read loop's scratch buffer and is only valid for the
    /// duration of the call.
    fn receive_data(
        &self,
        ctl: &ServerControl,
        conn: &mut Connection<Self::Attachment>,
        bytes_read: usize,
        data: &[u8],
    );

    /// One line typed on the operator console, without its line terminator.
    fn receive_console(&self, _ctl: &ServerControl, _input: &str) {}
}

struct ControlInner {
    running: AtomicBool,
    local_addr: SocketAddr,
    accept_waker: Waker,
    read_waker: Waker,
    closing: Mutex<Vec<ConnectionId>>,
}

/// Cloneable control surface of a running server, handed to every hook.
#[derive(Clone)]
pub struct ServerControl {
    inner: Arc<ControlInner>,
}

impl ServerControl {
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Stops accepting and reading. Both loops leave their blocking waits,
    /// every remaining connection is closed and reported through
    /// `disconnection`.
    pub fn shutdown(&self) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            info!(addr = %self.inner.local_addr, "server shutting down");
        }
        self.wake_acceptor();
        self.wake_reader();
    }

    /// Closes the socket behind `handle` now and has the read loop report
    /// `disconnection(handle)` once. Later calls for the same handle do
    /// nothing. Callable from any thread and from inside any hook.
    pub fn close_channel(&self, handle: &ConnectionHandle) {
        if !handle.mark_closed() {
            return;
        }
        handle.close_socket();
        self.inner.closing.lock().push(handle.id());
        self.wake_reader();
    }

    fn wake_acceptor(&self) {
        if let Err(e) = self.inner.accept_waker.wake() {
            warn!(error = %e, "failed to wake accept loop");
        }
    }

    fn wake_reader(&self) {
        if let Err(e) = self.inner.read_waker.wake() {
            warn!(error = %e, "failed to wake read loop");
        }
    }

    fn take_closing(&self) -> Vec<ConnectionId> {
        std::mem::take(&mut *self.inner.closing.lock())
    }
}

/// An accepted connection on its way from the accept loop to the read loop.
struct Pending<A> {
    handle: ConnectionHandle,
    stream: mio::net::TcpStream,
    attachment: A,
}

/// A bound server that has not started its loops yet.
pub struct Multiplexer<H: ServerHandler> {
    handler: Arc<H>,
    config: ServerConfig,
    listener: TcpListener,
    accept_poll: Poll,
    read_poll: Poll,
    control: ServerControl,
}

impl<H: ServerHandler> Multiplexer<H> {
    /// Binds the listening socket and opens both readiness sets.
    pub fn bind(config: ServerConfig, handler: H) -> Result<Self> {
        config.validate()?;
        let addr = config.resolve()?;

        let listener =
            std::net::TcpListener::bind(addr).map_err(|source| NetError::Bind { addr, source })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let mut listener = TcpListener::from_std(listener);

        let accept_poll = Poll::new()?;
        accept_poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let accept_waker = Waker::new(accept_poll.registry(), ACCEPT_WAKER_TOKEN)?;

        let read_poll = Poll::new()?;
        let read_waker = Waker::new(read_poll.registry(), READ_WAKER_TOKEN)?;

        info!(host = %config.host, addr = %local_addr, "server bound");

        Ok(Self {
            handler: Arc::new(handler),
            config,
            listener,
            accept_poll,
            read_poll,
            control: ServerControl {
                inner: Arc::new(ControlInner {
                    running: AtomicBool::new(true),
                    local_addr,
                    accept_waker,
                    read_waker,
                    closing: Mutex::new(Vec::new()),
                }),
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.control.local_addr()
    }

    pub fn control(&self) -> &ServerControl {
        &self.control
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Runs `init`, then starts the accept and read loops on their own threads.
    pub fn start(self) -> Result<ServerHandle> {
        let Multiplexer {
            handler,
            config,
            listener,
            accept_poll,
            read_poll,
            control,
        } = self;

        handler.init(&control);

        let (producer, consumer) = queue::channel::<Pending<H::Attachment>, HANDOFF_CAPACITY>();

        let acceptor = AcceptLoop {
            handler: handler.clone(),
            control: control.clone(),
            poll: accept_poll,
            listener,
            pending: producer,
            config: config.clone(),
            next_id: 1,
        };
        let accept_thread = thread::Builder::new()
            .name("lineserve-accept".into())
            .spawn(move || acceptor.run())?;

        let reader = ReadLoop {
            handler,
            control: control.clone(),
            poll: read_poll,
            pending: consumer,
            connections: HashMap::new(),
            scratch: vec![0u8; config.read_buffer_size],
            events_capacity: config.events_capacity,
        };
        let read_thread = match thread::Builder::new()
            .name("lineserve-read".into())
            .spawn(move || reader.run(accept_thread))
        {
            Ok(read_thread) => read_thread,
            Err(e) => {
                // the accept thread is detached; stop it before bailing out
                control.shutdown();
                return Err(e.into());
            }
        };

        Ok(ServerHandle {
            control,
            read_thread,
        })
    }

    /// Starts the server and dispatches operator console lines from stdin
    /// until the server is shut down.
    pub fn run(self) -> Result<()> {
        let stdin = io::stdin();
        self.run_with_console(stdin.lock())
    }

    /// Like [`run`](Self::run), reading console lines from `console`.
    ///
    /// When `console` runs dry before shutdown, keeps waiting for the server
    /// to be shut down some other way.
    pub fn run_with_console<R: BufRead>(self, console: R) -> Result<()> {
        let handler = self.handler.clone();
        let server = self.start()?;
        let control = server.control().clone();

        for line in console.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "console read failed");
                    break;
                }
            };
            handler.receive_console(&control, &line);
            if !control.is_running() {
                break;
            }
        }

        if control.is_running() {
            info!("console closed, waiting for shutdown");
        }
        server.join()
    }
}

/// A started server.
pub struct ServerHandle {
    control: ServerControl,
    read_thread: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn control(&self) -> &ServerControl {
        &self.control
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.control.local_addr()
    }

    pub fn shutdown(&self) {
        self.control.shutdown();
    }

    /// Waits until both loops have exited. A panic in either loop is
    /// reported as [`NetError::LoopPanicked`].
    pub fn join(self) -> Result<()> {
        self.read_thread
            .join()
            .map_err(|_| NetError::LoopPanicked("read loop"))?
    }
}

struct AcceptLoop<H: ServerHandler> {
    handler: Arc<H>,
    control: ServerControl,
    poll: Poll,
    listener: TcpListener,
    pending: Producer<Pending<H::Attachment>, HANDOFF_CAPACITY>,
    config: ServerConfig,
    next_id: u64,
}

/// Shuts the server down if the accept loop unwinds, so the read loop does
/// not keep serving a server that no longer accepts.
struct ShutdownOnPanic(ServerControl);

impl Drop for ShutdownOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("accept loop panicked, shutting down");
            self.0.shutdown();
        }
    }
}

impl<H: ServerHandler> AcceptLoop<H> {
    fn run(mut self) {
        let _guard = ShutdownOnPanic(self.control.clone());
        let mut events = Events::with_capacity(self.config.events_capacity);

        while self.control.is_running() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "accept readiness wait failed");
                self.control.shutdown();
                break;
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_connections();
                }
            }
        }

        debug!("accept loop stopped");
    }

    fn accept_connections(&mut self) {
        while self.control.is_running() {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let id = ConnectionId(self.next_id);
                    self.next_id += 1;

                    let established = ConnectionHandle::establish(
                        id,
                        connection::into_std(stream),
                        &self.config.socket,
                        self.config.write_nap,
                    );
                    let (handle, stream) = match established {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(%addr, error = %e, "failed to set up accepted connection");
                            continue;
                        }
                    };

                    let attachment = self.handler.get_attachment();
                    self.handler.new_client(&self.control, &handle);
                    info!(conn = %id, %addr, "client connected");

                    self.hand_off(Pending {
                        handle,
                        stream,
                        attachment,
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn hand_off(&mut self, mut pending: Pending<H::Attachment>) {
        loop {
            match self.pending.push(pending) {
                Ok(()) => break,
                Err(back) => {
                    if !self.control.is_running() {
                        // the read loop is about to join us and will not drain
                        back.handle.mark_closed();
                        back.handle.close_socket();
                        self.handler.disconnection(&self.control, &back.handle);
                        return;
                    }
                    pending = back;
                    self.control.wake_reader();
                    thread::yield_now();
                }
            }
        }
        self.control.wake_reader();
    }
}

struct Entry<A> {
    stream: mio::net::TcpStream,
    conn: Connection<A>,
}

struct ReadLoop<H: ServerHandler> {
    handler: Arc<H>,
    control: ServerControl,
    poll: Poll,
    pending: Consumer<Pending<H::Attachment>, HANDOFF_CAPACITY>,
    connections: HashMap<ConnectionId, Entry<H::Attachment>>,
    scratch: Vec<u8>,
    events_capacity: usize,
}

impl<H: ServerHandler> ReadLoop<H> {
    fn run(mut self, accept_thread: JoinHandle<()>) -> Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);

        while self.control.is_running() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "read readiness wait failed");
                self.control.shutdown();
                break;
            }

            for event in events.iter() {
                let token = event.token();
                if token != READ_WAKER_TOKEN {
                    self.drain(ConnectionId(token.0 as u64));
                }
            }

            self.register_pending();
            self.reap_closed();
        }

        let accepted = accept_thread
            .join()
            .map_err(|_| NetError::LoopPanicked("accept loop"));
        self.register_pending();
        self.close_all();
        debug!("read loop stopped");
        accepted
    }

    /// Reads one readable connection until it would block.
    fn drain(&mut self, id: ConnectionId) {
        let Some(entry) = self.connections.get_mut(&id) else {
            return;
        };

        let failed = loop {
            if entry.conn.handle().is_closed() {
                // closed by the application, reaped at the end of this iteration
                break false;
            }

            match entry.stream.read(&mut self.scratch) {
                Ok(0) => {
                    debug!(conn = %id, "end of stream");
                    break true;
                }
                Ok(n) => {
                    self.handler
                        .receive_data(&self.control, &mut entry.conn, n, &self.scratch[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break false,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(conn = %id, error = %e, "read failed");
                    break true;
                }
            }
        };

        if failed {
            self.close(id);
        }
    }

    fn register_pending(&mut self) {
        while let Some(pending) = self.pending.pop() {
            let Pending {
                handle,
                mut stream,
                attachment,
            } = pending;

            if handle.is_closed() {
                // closed before it ever reached the readiness set
                self.handler.disconnection(&self.control, &handle);
                continue;
            }

            let token = Token(handle.id().as_u64() as usize);
            if let Err(e) = self
                .poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
            {
                warn!(conn = %handle.id(), error = %e, "failed to register connection");
                handle.mark_closed();
                handle.close_socket();
                self.handler.disconnection(&self.control, &handle);
                continue;
            }

            self.connections.insert(
                handle.id(),
                Entry {
                    stream,
                    conn: Connection::new(handle, attachment),
                },
            );
        }
    }

    fn reap_closed(&mut self) {
        for id in self.control.take_closing() {
            self.close(id);
        }
    }

    /// Removes `id` from the readiness set and reports it. Removal happens
    /// once, so `disconnection` does too.
    fn close(&mut self, id: ConnectionId) {
        let Some(mut entry) = self.connections.remove(&id) else {
            return;
        };

        let handle = entry.conn.handle().clone();
        handle.mark_closed();
        handle.close_socket();
        if let Err(e) = self.poll.registry().deregister(&mut entry.stream) {
            debug!(conn = %id, error = %e, "deregister failed");
        }
        drop(entry);

        info!(conn = %id, peer = %handle.peer_addr(), "client disconnected");
        self.handler.disconnection(&self.control, &handle);
    }

    fn close_all(&mut self) {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort();
        for id in ids {
            self.close(id);
        }
        // requests that raced with shutdown refer to connections closed above
        self.control.take_closing();
    }
}
