//! POP3 replies and multi-line framing.
//!
//! Single-line replies are `+OK` / `-ERR` with human-readable text.
//! Multi-line payloads are terminated by a line containing a single
//! period; every payload line that begins with a period is prefixed with
//! one more (byte-stuffing). The terminator is always appended here — the
//! engine never relies on the store to emit it.

/// A single-line reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(String),
    Err(String),
}

impl Reply {
    pub fn ok(text: impl Into<String>) -> Self {
        Reply::Ok(text.into())
    }

    pub fn err(text: impl Into<String>) -> Self {
        Reply::Err(text.into())
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Reply::Ok(text) if text.is_empty() => b"+OK\r\n".to_vec(),
            Reply::Ok(text) => format!("+OK {text}\r\n").into_bytes(),
            Reply::Err(text) if text.is_empty() => b"-ERR\r\n".to_vec(),
            Reply::Err(text) => format!("-ERR {text}\r\n").into_bytes(),
        }
    }
}

/// Append `content` as a dot-stuffed multi-line payload, terminator
/// included. Bare LF line endings are normalised to CRLF on the way out.
pub fn write_multi_line(out: &mut Vec<u8>, content: &[u8]) {
    for line in split_lines(content) {
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
}

/// Append pre-formatted rows (CAPA, LIST, UIDL) and the terminator.
pub fn write_rows(out: &mut Vec<u8>, rows: &[String]) {
    for row in rows {
        out.extend_from_slice(row.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
}

/// Split message content into lines, accepting CRLF and bare LF, and
/// dropping a final empty fragment so the payload ends with exactly one
/// CRLF before the terminator.
fn split_lines(content: &[u8]) -> Vec<&[u8]> {
    let mut lines: Vec<&[u8]> = content
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect();

    if lines.last() == Some(&&b""[..]) && lines.len() > 1 {
        lines.pop();
    }

    lines
}
