//! Outbound writer: drains a whole buffer onto a non-blocking socket.
//!
//! The call blocks the calling thread until every byte is written or the
//! connection fails. When the socket buffer is full the writer waits for
//! write readiness (`poll(2)` with `POLLOUT`), bounded by the nap interval,
//! instead of spinning. There is no overall timeout: a peer that never drains
//! its receive buffer stalls the writer.

use std::io::{self, Write};
use std::net::TcpStream;
use std::time::Duration;

use tracing::{trace, warn};

/// Result of one [`write`] call. Only `Completed` means the bytes left this host.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Completed(usize),
    /// The connection failed part-way; it is presumed dead and the remainder
    /// was dropped.
    Abandoned { written: usize, total: usize },
}

impl WriteOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, WriteOutcome::Completed(_))
    }

    pub fn written(&self) -> usize {
        match *self {
            WriteOutcome::Completed(n) => n,
            WriteOutcome::Abandoned { written, .. } => written,
        }
    }
}

/// A non-blocking byte sink the writer can drain into.
pub trait Outbound {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Blocks until the sink is probably writable or `timeout` elapsed.
    fn wait_writable(&self, timeout: Duration);
}

impl Outbound for TcpStream {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    #[cfg(unix)]
    fn wait_writable(&self, timeout: Duration) {
        use std::os::unix::io::AsRawFd;

        let mut pfd = libc::pollfd {
            fd: self.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        let millis = timeout.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: pfd is a single valid pollfd for the duration of the call
        unsafe {
            libc::poll(&mut pfd, 1, millis);
        }
    }

    #[cfg(not(unix))]
    fn wait_writable(&self, timeout: Duration) {
        std::thread::sleep(timeout);
    }
}

/// Writes all of `buffer` to `target`, then clears `buffer` for reuse.
///
/// Failures are logged and the rest of the buffer is abandoned; they are
/// reported to the caller only as [`WriteOutcome::Abandoned`].
pub fn write<O: Outbound + ?Sized>(
    target: &O,
    buffer: &mut Vec<u8>,
    nap: Duration,
) -> WriteOutcome {
    let total = buffer.len();
    let mut written = 0;

    let outcome = loop {
        if written == total {
            break WriteOutcome::Completed(total);
        }

        match target.try_write(&buffer[written..]) {
            Ok(0) => {
                warn!(written, total, "connection stopped accepting bytes, write abandoned");
                break WriteOutcome::Abandoned { written, total };
            }
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(written, total, "socket buffer full, waiting for write readiness");
                target.wait_writable(nap);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!(written, total, error = %e, "write failed, remainder abandoned");
                break WriteOutcome::Abandoned { written, total };
            }
        }
    };

    buffer.clear();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    /// Accepts at most `chunk` bytes per call and refuses every other call.
    struct Throttled {
        chunk: usize,
        calls: Cell<usize>,
        waits: Cell<usize>,
        sink: RefCell<Vec<u8>>,
        fail_after: Option<usize>,
    }

    impl Throttled {
        fn new(chunk: usize) -> Self {
            Self {
                chunk,
                calls: Cell::new(0),
                waits: Cell::new(0),
                sink: RefCell::new(Vec::new()),
                fail_after: None,
            }
        }
    }

    impl Outbound for Throttled {
        fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
            let call = self.calls.get();
            self.calls.set(call + 1);

            if let Some(limit) = self.fail_after {
                if self.sink.borrow().len() >= limit {
                    return Err(io::ErrorKind::BrokenPipe.into());
                }
            }
            if call % 2 == 1 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.chunk);
            self.sink.borrow_mut().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn wait_writable(&self, _timeout: Duration) {
            self.waits.set(self.waits.get() + 1);
        }
    }

    #[test]
    fn partial_writes_are_retried_in_order() {
        let target = Throttled::new(7);
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut buffer = payload.clone();

        let outcome = write(&target, &mut buffer, Duration::from_millis(1));

        assert_eq!(outcome, WriteOutcome::Completed(1000));
        assert!(buffer.is_empty());
        assert_eq!(*target.sink.borrow(), payload);
        assert!(target.waits.get() > 0);
    }

    #[test]
    fn broken_connection_abandons_remainder() {
        let mut target = Throttled::new(10);
        target.fail_after = Some(30);
        let mut buffer = vec![1u8; 100];

        let outcome = write(&target, &mut buffer, Duration::from_millis(1));

        assert_eq!(outcome, WriteOutcome::Abandoned { written: 30, total: 100 });
        assert!(!outcome.is_completed());
        assert!(buffer.is_empty());
    }

    #[test]
    fn empty_buffer_completes_immediately() {
        let target = Throttled::new(1);
        let mut buffer = Vec::new();
        assert_eq!(write(&target, &mut buffer, Duration::ZERO), WriteOutcome::Completed(0));
        assert_eq!(target.calls.get(), 0);
    }
}
