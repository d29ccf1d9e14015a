//! Peer connection against an in-process echo server.

mod common;

use std::io::Read;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use lineserve::network::{PeerConfig, SocketOptions};
use lineserve::protocol::{LineBuffer, LineEncoder};
use lineserve::{
    Connection, ConnectionHandle, Multiplexer, PeerConnection, ServerControl, ServerHandle,
    ServerHandler, ServerListener,
};
use parking_lot::Mutex;

use common::{loopback, wait_for};

/// Echoes every line back; `bye` makes the server hang up.
struct LineEcho;

impl ServerHandler for LineEcho {
    type Attachment = LineBuffer;

    fn get_attachment(&self) -> LineBuffer {
        LineBuffer::new()
    }

    fn new_client(&self, _ctl: &ServerControl, _handle: &ConnectionHandle) {}

    fn disconnection(&self, _ctl: &ServerControl, _handle: &ConnectionHandle) {}

    fn receive_data(
        &self,
        ctl: &ServerControl,
        conn: &mut Connection<LineBuffer>,
        _bytes_read: usize,
        data: &[u8],
    ) {
        let (handle, lines) = conn.split();
        lines.feed(data);
        let mut encoder = LineEncoder::new(64);
        while let Some(line) = lines.next_line() {
            if line == "bye" {
                ctl.close_channel(handle);
                return;
            }
            let _ = handle.write(encoder.encode(&line));
        }
    }
}

fn echo_server() -> ServerHandle {
    Multiplexer::bind(loopback(), LineEcho)
        .unwrap()
        .start()
        .unwrap()
}

#[derive(Default)]
struct Recorder {
    lines: Mutex<Vec<String>>,
    disconnects: AtomicUsize,
    gone: AtomicBool,
    late_data: AtomicUsize,
}

impl ServerListener<LineBuffer> for Recorder {
    fn disconnected(&self) {
        self.gone.store(true, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn receive_data(&self, conn: &mut Connection<LineBuffer>, bytes_read: usize, data: &[u8]) {
        assert_eq!(bytes_read, data.len());
        if self.gone.load(Ordering::SeqCst) {
            self.late_data.fetch_add(1, Ordering::SeqCst);
        }
        let lines = conn.attachment_mut();
        lines.feed(data);
        while let Some(line) = lines.next_line() {
            self.lines.lock().push(line);
        }
    }
}

fn send(peer: &PeerConnection<LineBuffer, Recorder>, line: &str) {
    let mut encoder = LineEncoder::new(64);
    assert!(peer.write(encoder.encode(line)).is_completed());
}

#[test]
fn test_round_trip_through_echo() {
    let server = echo_server();
    let peer = PeerConnection::new(Recorder::default());
    peer.connect("127.0.0.1", server.local_addr().port(), LineBuffer::new())
        .unwrap();
    assert!(peer.is_connected());
    assert_eq!(peer.peer_addr(), Some(server.local_addr()));

    send(&peer, "hello");
    send(&peer, "world");
    wait_for("echo", || peer.listener().lines.lock().len() == 2);
    assert_eq!(*peer.listener().lines.lock(), vec!["hello", "world"]);

    peer.disconnect().unwrap();
    assert!(!peer.is_connected());
    assert_eq!(peer.listener().disconnects.load(Ordering::SeqCst), 1);

    server.shutdown();
    server.join().unwrap();
}

#[test]
fn test_connect_twice_is_rejected() {
    let server = echo_server();
    let port = server.local_addr().port();
    let peer = PeerConnection::new(Recorder::default());

    peer.connect("127.0.0.1", port, LineBuffer::new()).unwrap();
    let err = peer.connect("127.0.0.1", port, LineBuffer::new()).unwrap_err();
    assert!(err.is_invalid_state());

    // the first connection is untouched
    assert!(peer.is_connected());
    send(&peer, "still here");
    wait_for("echo", || !peer.listener().lines.lock().is_empty());
    assert_eq!(peer.listener().disconnects.load(Ordering::SeqCst), 0);

    peer.disconnect().unwrap();
    server.shutdown();
    server.join().unwrap();
}

#[test]
fn test_disconnect_fires_once_and_stops_delivery() {
    let server = echo_server();
    let peer = PeerConnection::new(Recorder::default());
    peer.connect("127.0.0.1", server.local_addr().port(), LineBuffer::new())
        .unwrap();

    peer.disconnect().unwrap();
    assert!(peer.disconnect().unwrap_err().is_invalid_state());

    thread::sleep(Duration::from_millis(50));
    let listener = peer.listener();
    assert_eq!(listener.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(listener.late_data.load(Ordering::SeqCst), 0);

    let mut buffer = b"after disconnect\n".to_vec();
    assert!(!peer.write(&mut buffer).is_completed());

    server.shutdown();
    server.join().unwrap();
}

#[test]
fn test_server_hangup_reports_disconnect() {
    let server = echo_server();
    let peer = PeerConnection::new(Recorder::default());
    peer.connect("127.0.0.1", server.local_addr().port(), LineBuffer::new())
        .unwrap();

    send(&peer, "bye");
    wait_for("disconnect", || {
        peer.listener().disconnects.load(Ordering::SeqCst) == 1
    });
    assert!(!peer.is_connected());
    assert!(peer.disconnect().unwrap_err().is_invalid_state());

    server.shutdown();
    server.join().unwrap();
}

#[test]
fn test_server_shutdown_reports_disconnect() {
    let server = echo_server();
    let peer = PeerConnection::new(Recorder::default());
    peer.connect("127.0.0.1", server.local_addr().port(), LineBuffer::new())
        .unwrap();

    server.shutdown();
    server.join().unwrap();

    wait_for("disconnect", || {
        peer.listener().disconnects.load(Ordering::SeqCst) == 1
    });
}

#[test]
fn test_reconnect_after_disconnect() {
    let server = echo_server();
    let port = server.local_addr().port();
    let peer = PeerConnection::new(Recorder::default());

    peer.connect("127.0.0.1", port, LineBuffer::new()).unwrap();
    send(&peer, "first");
    wait_for("first echo", || peer.listener().lines.lock().len() == 1);
    peer.disconnect().unwrap();

    peer.connect("127.0.0.1", port, LineBuffer::new()).unwrap();
    send(&peer, "second");
    wait_for("second echo", || peer.listener().lines.lock().len() == 2);
    assert_eq!(*peer.listener().lines.lock(), vec!["first", "second"]);

    drop(peer);
    server.shutdown();
    server.join().unwrap();
}

#[test]
fn test_drop_disconnects() {
    let server = echo_server();
    let recorder = Arc::new(AtomicUsize::new(0));

    struct Counted(Arc<AtomicUsize>);

    impl ServerListener<()> for Counted {
        fn disconnected(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn receive_data(&self, _conn: &mut Connection<()>, _bytes_read: usize, _data: &[u8]) {}
    }

    let peer = PeerConnection::new(Counted(recorder.clone()));
    peer.connect("127.0.0.1", server.local_addr().port(), ())
        .unwrap();
    drop(peer);
    assert_eq!(recorder.load(Ordering::SeqCst), 1);

    server.shutdown();
    server.join().unwrap();
}

/// Hangs up from inside its own delivery callback.
struct HangUp {
    peer: Mutex<Weak<PeerConnection<LineBuffer, HangUp>>>,
    disconnects: AtomicUsize,
    seen: AtomicUsize,
}

impl ServerListener<LineBuffer> for HangUp {
    fn disconnected(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn receive_data(&self, _conn: &mut Connection<LineBuffer>, _bytes_read: usize, _data: &[u8]) {
        self.seen.fetch_add(1, Ordering::SeqCst);
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.disconnect().unwrap();
        }
    }
}

#[test]
fn test_disconnect_from_inside_callback() {
    let server = echo_server();
    let peer = Arc::new(PeerConnection::new(HangUp {
        peer: Mutex::new(Weak::new()),
        disconnects: AtomicUsize::new(0),
        seen: AtomicUsize::new(0),
    }));
    *peer.listener().peer.lock() = Arc::downgrade(&peer);

    peer.connect("127.0.0.1", server.local_addr().port(), LineBuffer::new())
        .unwrap();
    let mut encoder = LineEncoder::new(64);
    assert!(peer.write(encoder.encode("ping")).is_completed());

    wait_for("hang up", || !peer.is_connected());
    assert_eq!(peer.listener().disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(peer.listener().seen.load(Ordering::SeqCst), 1);

    server.shutdown();
    server.join().unwrap();
}

#[test]
fn test_throttled_reader_receives_everything_in_order() {
    const TOTAL: usize = 1 << 20;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let reader = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut received = Vec::with_capacity(TOTAL);
        let mut chunk = [0u8; 4096];
        while received.len() < TOTAL {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&chunk[..n]);
            thread::sleep(Duration::from_micros(100));
        }
        received
    });

    let config = PeerConfig {
        socket: SocketOptions {
            send_buffer_size: Some(4096),
            ..SocketOptions::default()
        },
        ..PeerConfig::default()
    };
    let peer = PeerConnection::with_config(Recorder::default(), config);
    peer.connect("127.0.0.1", port, LineBuffer::new()).unwrap();

    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
    let mut buffer = payload.clone();
    let outcome = peer.write(&mut buffer);
    assert_eq!(outcome.written(), TOTAL);
    assert!(outcome.is_completed());
    assert!(buffer.is_empty());

    let received = reader.join().unwrap();
    assert_eq!(received.len(), TOTAL);
    assert!(received == payload, "bytes arrived out of order");

    peer.disconnect().unwrap();
}

#[test]
fn test_writing_to_vanished_server_is_abandoned() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer = PeerConnection::new(Recorder::default());
    peer.connect("127.0.0.1", port, LineBuffer::new()).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    drop(accepted);
    drop(listener);

    wait_for("disconnect", || {
        peer.listener().disconnects.load(Ordering::SeqCst) == 1
    });

    let mut payload = vec![7u8; 64 * 1024];
    let outcome = peer.write(&mut payload);
    assert!(!outcome.is_completed());
    assert!(payload.is_empty());
}
