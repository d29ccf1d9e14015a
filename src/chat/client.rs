use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::network::{Connection, PeerConnection, ServerListener};
use crate::protocol::LineBuffer;

type LineSink = Box<dyn Fn(&str) + Send + Sync>;

/// Client side of the chat: hands every complete line from the server to a
/// sink and tracks whether the connection is still up.
pub struct ChatClient {
    sink: LineSink,
    connected: Arc<AtomicBool>,
    announce_disconnect: bool,
}

impl ChatClient {
    pub fn new(sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            connected: Arc::new(AtomicBool::new(false)),
            announce_disconnect: false,
        }
    }

    /// Prints received lines to stdout, and a notice when the connection drops.
    pub fn printing() -> Self {
        Self {
            announce_disconnect: true,
            ..Self::new(|line| println!("{line}"))
        }
    }

    /// Shared flag, set by [`mark_connected`](Self::mark_connected) and cleared
    /// when the connection goes away.
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// Connects `peer` to a chat server with a fresh line buffer.
///
/// The connected flag is raised before the connection exists, so a server
/// that hangs up straight away still leaves it cleared.
pub fn connect(
    peer: &PeerConnection<LineBuffer, ChatClient>,
    host: &str,
    port: u16,
) -> Result<()> {
    let client = peer.listener();
    client.mark_connected();
    if let Err(e) = peer.connect(host, port, LineBuffer::new()) {
        client.connected.store(false, Ordering::Release);
        return Err(e);
    }
    Ok(())
}

impl ServerListener<LineBuffer> for ChatClient {
    fn disconnected(&self) {
        debug!("chat connection closed");
        self.connected.store(false, Ordering::Release);
        if self.announce_disconnect {
            println!("Disconnected from server.");
        }
    }

    fn receive_data(&self, conn: &mut Connection<LineBuffer>, _bytes_read: usize, data: &[u8]) {
        let lines = conn.attachment_mut();
        lines.feed(data);
        while let Some(line) = lines.next_line() {
            (self.sink)(&line);
        }
    }
}
