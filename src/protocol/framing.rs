//! Line buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for buffer management. Incoming bytes are pushed
//! as they arrive from the socket; complete newline-terminated lines are
//! extracted and the partial remainder stays buffered for the next push.
//! A line that is not valid UTF-8, or an unterminated line growing past the
//! limit, is a framing error and fatal to the connection.

use bytes::BytesMut;

use crate::error::{Error, Result};

/// Default maximum length of a single unterminated line: 16 MiB.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Buffer for accumulating incoming bytes and extracting complete lines.
pub struct LineBuffer {
    buffer: BytesMut,
    max_line_bytes: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line(max_line_bytes: usize) -> Self {
        LineBuffer {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_line_bytes,
        }
    }

    /// Push data into the buffer and extract all complete lines.
    ///
    /// Returns the lines without their terminating newline. Empty lines are
    /// skipped. Partial data is buffered internally for the next push.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<String>> {
        self.buffer.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            let text = std::str::from_utf8(line)
                .map_err(|_| Error::Protocol("frame is not valid UTF-8".into()))?;
            lines.push(text.to_string());
        }

        if self.buffer.len() > self.max_line_bytes {
            return Err(Error::Protocol(format!(
                "unterminated line exceeds maximum of {} bytes",
                self.max_line_bytes
            )));
        }
        Ok(lines)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_complete_line() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"{\"a\":1}\n").unwrap();
        assert_eq!(lines, vec!["{\"a\":1}".to_string()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn multiple_lines_in_one_push() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"one\ntwo\nthree\n").unwrap();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn partial_line_is_buffered() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"{\"partial\":").unwrap().is_empty());
        assert_eq!(buffer.len(), 11);
        let lines = buffer.push(b"true}\nnext").unwrap();
        assert_eq!(lines, vec!["{\"partial\":true}"]);
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn byte_at_a_time() {
        let mut buffer = LineBuffer::new();
        let mut all = Vec::new();
        for byte in b"hi\nyo\n" {
            all.extend(buffer.push(&[*byte]).unwrap());
        }
        assert_eq!(all, vec!["hi", "yo"]);
    }

    #[test]
    fn empty_lines_are_skipped() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"\n\na\n\n").unwrap();
        assert_eq!(lines, vec!["a"]);
    }

    #[test]
    fn invalid_utf8_is_fatal() {
        let mut buffer = LineBuffer::new();
        let result = buffer.push(&[0xff, 0xfe, b'\n']);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn oversized_unterminated_line_is_fatal() {
        let mut buffer = LineBuffer::with_max_line(8);
        assert!(buffer.push(b"12345678").is_ok());
        assert!(matches!(buffer.push(b"9"), Err(Error::Protocol(_))));
    }
}
