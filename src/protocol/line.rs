//! Newline-terminated text lines on top of the raw byte chunks the core
//! delivers.
//!
//! [`LineBuffer`] is meant to be a connection attachment: feed it every chunk
//! from `receive_data` and pull complete lines out of it. [`LineEncoder`] is a
//! reusable write buffer holding one outgoing line.

use std::borrow::Cow;

pub const LINE_TERMINATOR: u8 = b'\n';

/// Reusable buffer for outgoing lines.
#[derive(Debug, Default)]
pub struct LineEncoder {
    buffer: Vec<u8>,
}

impl LineEncoder {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Replaces the buffer content with `msg` plus the line terminator and
    /// returns the buffer, ready for a write.
    pub fn encode(&mut self, msg: &str) -> &mut Vec<u8> {
        self.buffer.clear();
        self.buffer.extend_from_slice(msg.as_bytes());
        self.buffer.push(LINE_TERMINATOR);
        &mut self.buffer
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

/// Accumulates partial input until a line terminator arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    // bytes before this offset are known to hold no terminator
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Takes the next complete line, trimmed of its terminator (`\n` or
    /// `\r\n`) and surrounding whitespace. Invalid UTF-8 is replaced.
    pub fn next_line(&mut self) -> Option<String> {
        let offset = self.buffer[self.scanned..]
            .iter()
            .position(|&b| b == LINE_TERMINATOR);

        let Some(offset) = offset else {
            self.scanned = self.buffer.len();
            return None;
        };

        let end = self.scanned + offset;
        let line = match String::from_utf8_lossy(&self.buffer[..end]) {
            Cow::Borrowed(s) => s.trim().to_string(),
            Cow::Owned(s) => s.trim().to_string(),
        };

        self.buffer.drain(..=end);
        self.scanned = 0;
        Some(line)
    }

    /// Bytes held that do not form a complete line yet.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }
}
