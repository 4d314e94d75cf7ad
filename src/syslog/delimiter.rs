//! TCP Frame Delimiter
//!
//! Splits a TCP byte stream into newline-terminated syslog frames with a
//! bounded buffer: a line that exceeds the buffer is emitted as-is
//! rather than growing without limit.

/// Newline framing with a capped buffer.
#[derive(Debug)]
pub struct LineDelimiter {
    buf: Vec<u8>,
    max: usize,
}

impl LineDelimiter {
    pub fn new(max: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max.min(4096)),
            max: max.max(1),
        }
    }

    /// Push one byte; returns a complete frame when one ends here.
    pub fn push(&mut self, b: u8) -> Option<String> {
        if b == b'\n' {
            return self.take();
        }
        self.buf.push(b);
        if self.buf.len() >= self.max {
            return self.take();
        }
        None
    }

    /// Whatever is left in the buffer, e.g. on connection close or an
    /// idle-read timeout.
    pub fn vestige(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}
