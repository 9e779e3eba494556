//! Line assembly
//!
//! The transport hands over arbitrary chunks, so one response may arrive split
//! across several of them. Bytes are collected here until a delimiter shows up.

use tracing::{debug, warn};

use super::stream::{ByteChannel, Received};

/// Default record delimiter
pub const DEFAULT_DELIMITER: u8 = b'\n';

/// Default longest accepted line, in bytes
pub const DEFAULT_MAX_LINE_LEN: usize = 512;

/// Output of [`LineAssembler::read_frame`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line
    Line(String),
    /// A channel mark, in its position relative to the surrounding lines
    Mark,
}

/// Accumulates bytes into complete text lines
#[derive(Debug)]
pub struct LineAssembler {
    buffer: Vec<u8>,
    delimiter: u8,
    max_len: usize,
    /// Set while discarding the remainder of an oversized line
    overflowed: bool,
}

impl LineAssembler {
    /// Create an assembler splitting on `delimiter` and accepting lines of at
    /// most `max_len` bytes
    pub fn new(delimiter: u8, max_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_len.min(1024)),
            delimiter,
            max_len: max_len.max(1),
            overflowed: false,
        }
    }

    /// Feed one byte; returns a line when `byte` completes one.
    ///
    /// A trailing `\r` is stripped and blank lines are skipped.
    pub fn push_byte(&mut self, byte: u8) -> Option<String> {
        if byte == self.delimiter {
            if self.overflowed {
                self.overflowed = false;
                return None;
            }
            return self.take_line();
        }

        if self.overflowed {
            return None;
        }

        if self.buffer.len() >= self.max_len {
            warn!(
                max_len = self.max_len,
                "Response line too long, discarding until next delimiter"
            );
            self.buffer.clear();
            self.overflowed = true;
            return None;
        }

        self.buffer.push(byte);
        None
    }

    /// Feed a whole chunk, collecting every line it completes
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        bytes.iter().filter_map(|&b| self.push_byte(b)).collect()
    }

    /// Block on `channel` until a full line is available. Marks are skipped.
    ///
    /// Returns `None` once the channel reaches end of stream; an unfinished
    /// line is discarded at that point.
    pub fn read_line(&mut self, channel: &ByteChannel) -> Option<String> {
        loop {
            match self.read_frame(channel)? {
                Frame::Line(line) => return Some(line),
                Frame::Mark => continue,
            }
        }
    }

    /// Block on `channel` until a full line or a mark is available.
    ///
    /// A mark arriving in the middle of a line is returned right away; the
    /// partial line stays buffered and completes after it.
    pub fn read_frame(&mut self, channel: &ByteChannel) -> Option<Frame> {
        loop {
            match channel.next() {
                Some(Received::Byte(byte)) => {
                    if let Some(line) = self.push_byte(byte) {
                        return Some(Frame::Line(line));
                    }
                }
                Some(Received::Mark) => return Some(Frame::Mark),
                None => {
                    if !self.buffer.is_empty() {
                        debug!(
                            pending = self.buffer.len(),
                            "End of stream with incomplete line"
                        );
                    }
                    self.reset();
                    return None;
                }
            }
        }
    }

    /// Drop any partially assembled line
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.overflowed = false;
    }

    fn take_line(&mut self) -> Option<String> {
        if self.buffer.last() == Some(&b'\r') {
            self.buffer.pop();
        }
        if self.buffer.is_empty() {
            return None;
        }

        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Some(line)
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER, DEFAULT_MAX_LINE_LEN)
    }
}
