//! Newline-delimited UTF-8 line framing.

/// Incremental decoder/encoder for the line protocol.
///
/// Bytes are buffered until a `\n` arrives; a partial tail left in the buffer
/// when the connection closes is simply dropped with the codec.
#[derive(Debug, Default)]
pub struct LineCodec {
    buf: Vec<u8>,
}

impl LineCodec {
    /// Create an empty codec
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes and return every line they complete.
    ///
    /// Invalid UTF-8 is replaced with U+FFFD rather than rejected.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);

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

    /// Bytes buffered for an incomplete line
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Frame a message for the wire.
    ///
    /// Embedded `\n` characters are not escaped, so a multi-line message
    /// arrives as several lines.
    pub fn encode(message: &str) -> Vec<u8> {
        let mut frame = Vec::with_capacity(message.len() + 1);
        frame.extend_from_slice(message.as_bytes());
        frame.push(b'\n');
        frame
    }
}
