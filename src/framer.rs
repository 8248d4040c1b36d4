//! CRLF line framing.
//!
//! The framer consumes whatever arrived from the transport and yields
//! complete lines, CRLF stripped, in order. It enforces a maximum line
//! length and supports a raw mode in which a known byte count (an IMAP
//! literal) bypasses line splitting entirely and is handed out in chunks.

use bytes::{Buf, Bytes, BytesMut};

use crate::error::FatalError;

/// Splits a byte stream into CRLF-terminated lines.
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    /// Scan resume position; bytes before it are known to contain no LF.
    scanned: usize,
    max_line_length: usize,
}

impl LineFramer {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            max_line_length,
        }
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered, not yet consumed bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Yield the next complete line with its CRLF stripped.
    ///
    /// Returns `Ok(None)` when no full line is buffered yet. A line longer
    /// than the configured maximum, or one terminated by a bare LF, is a
    /// connection-fatal condition.
    pub fn next_line(&mut self) -> Result<Option<Bytes>, FatalError> {
        match self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let end = self.scanned + offset + 1;
                self.scanned = 0;

                if end > self.max_line_length {
                    return Err(FatalError::LineTooLong(self.max_line_length));
                }
                if end < 2 || self.buffer[end - 2] != b'\r' {
                    return Err(FatalError::NotCrLf);
                }

                let mut line = self.buffer.split_to(end);
                line.truncate(line.len() - 2);

                Ok(Some(line.freeze()))
            }
            None => {
                self.scanned = self.buffer.len();

                if self.scanned >= self.max_line_length {
                    return Err(FatalError::LineTooLong(self.max_line_length));
                }

                Ok(None)
            }
        }
    }

    /// Take up to `limit` raw bytes, ignoring line structure.
    ///
    /// Used while a literal is active: bytes belonging to the literal must
    /// not be CRLF-split.
    pub fn take_raw(&mut self, limit: usize) -> Bytes {
        let n = limit.min(self.buffer.len());
        self.scanned = 0;
        self.buffer.copy_to_bytes(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_are_split_in_order() {
        let mut framer = LineFramer::new(1024);
        framer.extend(b"a NOOP\r\nb CAPABILITY\r\n");

        assert_eq!(framer.next_line().unwrap().unwrap(), "a NOOP");
        assert_eq!(framer.next_line().unwrap().unwrap(), "b CAPABILITY");
        assert!(framer.next_line().unwrap().is_none());
    }

    #[test]
    fn test_partial_line_waits_for_more_bytes() {
        let mut framer = LineFramer::new(1024);

        framer.extend(b"a NO");
        assert!(framer.next_line().unwrap().is_none());

        framer.extend(b"OP\r");
        assert!(framer.next_line().unwrap().is_none());

        framer.extend(b"\n");
        assert_eq!(framer.next_line().unwrap().unwrap(), "a NOOP");
    }

    #[test]
    fn test_bare_lf_is_fatal() {
        let mut framer = LineFramer::new(1024);
        framer.extend(b"a NOOP\n");

        assert!(matches!(framer.next_line(), Err(FatalError::NotCrLf)));
    }

    #[test]
    fn test_line_too_long_detected_before_terminator() {
        let mut framer = LineFramer::new(8);
        framer.extend(b"aaaaaaaaaaaaaaaa");

        assert!(matches!(
            framer.next_line(),
            Err(FatalError::LineTooLong(8))
        ));
    }

    #[test]
    fn test_line_too_long_with_terminator() {
        let mut framer = LineFramer::new(8);
        framer.extend(b"aaaaaaaaaa\r\n");

        assert!(matches!(
            framer.next_line(),
            Err(FatalError::LineTooLong(8))
        ));
    }

    #[test]
    fn test_take_raw_bypasses_line_structure() {
        let mut framer = LineFramer::new(1024);
        framer.extend(b"Hello\r\nWorld\r\na DONE\r\n");

        // A 14-octet literal swallows both "lines" of payload.
        let chunk = framer.take_raw(14);
        assert_eq!(chunk.as_ref(), b"Hello\r\nWorld\r\n");

        assert_eq!(framer.next_line().unwrap().unwrap(), "a DONE");
    }

    #[test]
    fn test_take_raw_returns_less_when_starved() {
        let mut framer = LineFramer::new(1024);
        framer.extend(b"abc");

        assert_eq!(framer.take_raw(10).as_ref(), b"abc");
        assert_eq!(framer.buffered(), 0);
    }
}
