use parking_lot::Mutex;
use tracing::{debug, info};

use crate::network::{Connection, ConnectionHandle, ServerControl, ServerHandler};
use crate::protocol::{LineBuffer, LineEncoder};

pub const SHUTDOWN_COMMAND: &str = "shutdown";
pub const QUIT_COMMAND: &str = "quit";
pub const GOODBYE: &str = "<Server is shutting down. Goodbye.>";

/// Broadcast chat room: every line a client sends is relayed to all others.
pub struct ChatServer {
    clients: Mutex<Vec<ConnectionHandle>>,
    // hooks run on several threads; one writer at a time per socket
    outbound: Mutex<LineEncoder>,
}

impl Default for ChatServer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatServer {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            outbound: Mutex::new(LineEncoder::new(256)),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Sends `msg` to every client except `skip`.
    fn broadcast(&self, msg: &str, skip: Option<&ConnectionHandle>) {
        let targets: Vec<ConnectionHandle> = self.clients.lock().clone();

        let mut encoder = self.outbound.lock();
        for target in targets.iter().filter(|t| Some(*t) != skip) {
            let outcome = target.write(encoder.encode(msg));
            if !outcome.is_completed() {
                debug!(conn = %target.id(), ?outcome, "chat line not delivered");
            }
        }
    }
}

impl ServerHandler for ChatServer {
    type Attachment = LineBuffer;

    fn init(&self, ctl: &ServerControl) {
        info!(addr = %ctl.local_addr(), "chat server ready");
    }

    fn get_attachment(&self) -> LineBuffer {
        LineBuffer::new()
    }

    fn new_client(&self, _ctl: &ServerControl, handle: &ConnectionHandle) {
        let ip = handle.peer_addr().ip();
        self.broadcast(&format!("login from: {ip}"), None);

        // holding the encoder keeps relayed lines behind the welcome
        let mut encoder = self.outbound.lock();
        let online = {
            let mut clients = self.clients.lock();
            clients.push(handle.clone());
            clients.len()
        };

        let welcome = format!("Welcome to Chatter Box! There are {online} users online.");
        for msg in [welcome.as_str(), "Type 'quit' to exit."] {
            let outcome = handle.write(encoder.encode(msg));
            if !outcome.is_completed() {
                debug!(conn = %handle.id(), ?outcome, "welcome not delivered");
            }
        }
    }

    fn disconnection(&self, _ctl: &ServerControl, handle: &ConnectionHandle) {
        let removed = {
            let mut clients = self.clients.lock();
            let before = clients.len();
            clients.retain(|c| c != handle);
            before != clients.len()
        };

        if removed {
            self.broadcast(&format!("logout: {}", handle.peer_addr().ip()), None);
        }
    }

    fn receive_data(
        &self,
        ctl: &ServerControl,
        conn: &mut Connection<LineBuffer>,
        _bytes_read: usize,
        data: &[u8],
    ) {
        let (handle, lines) = conn.split();
        lines.feed(data);

        while let Some(line) = lines.next_line() {
            if line.is_empty() {
                continue;
            }
            if line.eq_ignore_ascii_case(QUIT_COMMAND) {
                ctl.close_channel(handle);
                lines.clear();
                return;
            }
            self.broadcast(&format!("{}: {line}", handle.peer_addr().ip()), Some(handle));
        }
    }

    fn receive_console(&self, ctl: &ServerControl, input: &str) {
        let input = input.trim();
        if input.eq_ignore_ascii_case(SHUTDOWN_COMMAND) {
            self.broadcast(GOODBYE, None);
            ctl.shutdown();
        } else if !input.is_empty() {
            self.broadcast(&format!("server: {input}"), None);
        }
    }
}
