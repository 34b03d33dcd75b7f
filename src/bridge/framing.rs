//! Newline framing for the worker's stdout.
//!
//! Bytes arrive in arbitrary chunks. `LineFramer` buffers the trailing
//! partial line until its terminator shows up, so a line split across reads
//! is emitted once and several lines in one read are emitted in order.

/// Splits a byte stream into text lines.
#[derive(Debug, Default)]
pub(crate) struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every line it completes.
    ///
    /// Lines are returned without their `\n` (or `\r\n`) terminator. Blank
    /// lines are skipped.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.buffer.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];
            if let Some(line) = Self::take_line(&mut self.buffer) {
                lines.push(line);
            }
        }

        self.buffer.extend_from_slice(rest);
        lines
    }

    /// Flush the unterminated remainder at end of stream.
    pub(crate) fn finish(&mut self) -> Option<String> {
        Self::take_line(&mut self.buffer)
    }

    /// Bytes currently held back waiting for a terminator.
    pub(crate) fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
        if buffer.last() == Some(&b'\r') {
            buffer.pop();
        }
        let line = String::from_utf8_lossy(buffer).into_owned();
        buffer.clear();
        if line.trim().is_empty() {
            None
        } else {
            Some(line)
        }
    }
}
