//! Incremental newline framing for the stdio transport.
//!
//! Input arrives in arbitrary read-sized chunks; a protocol message is one
//! newline-terminated line. The buffer keeps the unterminated tail across
//! reads. A tail still unterminated when the stream ends is dropped, never
//! parsed as a message.

/// Accumulates raw bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk of raw bytes and returns every line it completes, in
    /// order, without their terminators. Bytes after the last newline stay
    /// buffered for the next call, so multi-byte characters split across
    /// reads are reassembled before decoding.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(String::from_utf8_lossy(&self.buf[start..end]).into_owned());
            start = end + 1;
        }
        self.buf.drain(..start);
        lines
    }

    /// Bytes still waiting for a terminator.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}
