//! Line codec.
//!
//! Every protocol message is one line terminated by `\n`. Inside a line a
//! backslash is sent as `\/` and a newline as `\n`, so the payload may carry
//! arbitrary bytes (file blocks included).

use crate::error::{Error, Result};

/// Line terminator on the wire.
pub const LINE_TERMINATOR: u8 = b'\n';

const ESCAPE: u8 = b'\\';

/// Escape `line` without appending the terminator.
pub fn escape(line: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(line.len() + line.len() / 16 + 1);
    for &b in line {
        match b {
            ESCAPE => out.extend_from_slice(b"\\/"),
            LINE_TERMINATOR => out.extend_from_slice(b"\\n"),
            _ => out.push(b),
        }
    }
    out
}

/// Escape `line` and append the terminator, ready for the socket.
pub fn encode_line(line: &[u8]) -> Vec<u8> {
    let mut out = escape(line);
    out.push(LINE_TERMINATOR);
    out
}

/// Reverse [`escape`], left to right.
///
/// An unknown escape (`\` followed by anything but `n` or `/`) is passed
/// through as the two original bytes, as is a trailing lone backslash.
pub fn unescape(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == ESCAPE && i + 1 < raw.len() {
            match raw[i + 1] {
                b'n' => {
                    out.push(LINE_TERMINATOR);
                    i += 2;
                    continue;
                }
                b'/' => {
                    out.push(ESCAPE);
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    out
}

/// Splits a byte stream into decoded lines.
///
/// Bytes after the last terminator are carried over to the next
/// [`feed`](Self::feed). A line that needs more than `max_fragments` reads,
/// or grows to `max_line_length` bytes without a terminator, is a framing
/// error and the connection must be dropped.
#[derive(Debug)]
pub struct LineFramer {
    pending: Vec<u8>,
    fragments: usize,
    max_fragments: usize,
    max_line_length: usize,
}

impl LineFramer {
    /// Create a framer with the given limits.
    pub fn new(max_fragments: usize, max_line_length: usize) -> Self {
        Self {
            pending: Vec::new(),
            fragments: 0,
            max_fragments,
            max_line_length,
        }
    }

    /// Append one read's worth of bytes.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(data);

        match self.pending.iter().rposition(|&b| b == LINE_TERMINATOR) {
            Some(last) => {
                self.fragments = 0;
                if self.pending.len() - last - 1 >= self.max_line_length {
                    return Err(Error::Framing("receive buffer full".into()));
                }
            }
            None => {
                self.fragments += 1;
                if self.fragments > self.max_fragments {
                    return Err(Error::Framing(format!(
                        "line fragmented over more than {} reads",
                        self.max_fragments
                    )));
                }
                if self.pending.len() >= self.max_line_length {
                    return Err(Error::Framing("receive buffer full".into()));
                }
            }
        }
        Ok(())
    }

    /// Pop the next complete line, decoded.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.pending.iter().position(|&b| b == LINE_TERMINATOR)?;
        let raw: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(unescape(&raw[..raw.len() - 1]))
    }

    /// Bytes received after the last complete line.
    pub fn remaining(&self) -> &[u8] {
        &self.pending
    }
}
