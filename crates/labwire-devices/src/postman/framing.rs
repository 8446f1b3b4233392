/*!
 * Newline framing shared by every postman.
 */
use bytes::{Buf, BytesMut};
use tracing::warn;

use labwire_core::buffer::{MessageBuffer, OverflowPolicy};
use labwire_core::config::PostmanConfig;

/// Line terminator used on the wire
pub const TERMINATOR: char = '\n';

/// Longest line accepted before the partial line is discarded as garbage
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Append the terminator to `value` unless it already ends with one
pub fn terminate(value: &str) -> String {
    let mut line = String::with_capacity(value.len() + 1);
    line.push_str(value);
    if !line.ends_with(TERMINATOR) {
        line.push(TERMINATOR);
    }
    line
}

/// Accumulates raw bytes and hands out complete lines one at a time
///
/// Bytes are buffered until a `\n` arrives. The terminator and a preceding
/// `\r` are stripped, blank lines are skipped and invalid UTF-8 is replaced so
/// that a garbled frame still reaches the decoder (and is rejected there).
#[derive(Debug)]
pub struct FrameAssembler {
    partial: BytesMut,
    lines: MessageBuffer<String>,
}

impl FrameAssembler {
    /// Create an assembler whose completed-line queue follows the given policy
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            partial: BytesMut::with_capacity(1024),
            lines: MessageBuffer::with_capacity(capacity, policy),
        }
    }

    /// Create an assembler sized from a [`PostmanConfig`]
    pub fn from_config(config: &PostmanConfig) -> Self {
        Self::new(config.buffer_capacity, config.overflow)
    }

    /// Feed received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);

        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let mut frame = self.partial.split_to(pos + 1);
            frame.truncate(pos);
            if frame.last() == Some(&b'\r') {
                frame.truncate(frame.len() - 1);
            }
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let line = String::from_utf8_lossy(&frame).into_owned();
            match self.lines.store(line) {
                Ok(Some(_)) => warn!("Inbound line buffer full, dropped oldest line"),
                Ok(None) => {}
                Err(e) => warn!("Inbound line dropped: {}", e),
            }
        }

        if self.partial.len() > MAX_LINE_LEN {
            warn!("Discarding {} bytes without a line terminator", self.partial.len());
            self.partial.advance(self.partial.len());
        }
    }

    /// Take the oldest complete line
    pub fn next_line(&mut self) -> Option<String> {
        self.lines.get()
    }

    /// Whether a complete line is waiting
    pub fn has_line(&self) -> bool {
        !self.lines.is_empty()
    }

    /// Drop buffered bytes and lines
    pub fn flush(&mut self) {
        self.partial.clear();
        self.lines.flush();
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::from_config(&PostmanConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminate() {
        assert_eq!(terminate("{}"), "{}\n");
        assert_eq!(terminate("{}\n"), "{}\n");
    }

    #[test]
    fn test_split_across_chunks() {
        let mut assembler = FrameAssembler::default();
        assembler.push(b"{\"a\":");
        assert!(!assembler.has_line());
        assembler.push(b"1}\r\n{\"b\":2}\n\n{\"c\"");
        assert_eq!(assembler.next_line().as_deref(), Some("{\"a\":1}"));
        assert_eq!(assembler.next_line().as_deref(), Some("{\"b\":2}"));
        assert_eq!(assembler.next_line(), None);
        assembler.push(b":3}\n");
        assert_eq!(assembler.next_line().as_deref(), Some("{\"c\":3}"));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut assembler = FrameAssembler::default();
        assembler.push(&[0x7b, 0xff, 0xfe, 0x7d, b'\n']);
        let line = assembler.next_line().unwrap();
        assert!(line.starts_with('{'));
        assert!(line.contains('\u{fffd}'));
    }

    #[test]
    fn test_overflow_evicts_oldest_line() {
        let mut assembler = FrameAssembler::new(2, OverflowPolicy::EvictOldest);
        assembler.push(b"one\ntwo\nthree\n");
        assert_eq!(assembler.next_line().as_deref(), Some("two"));
        assert_eq!(assembler.next_line().as_deref(), Some("three"));
    }

    #[test]
    fn test_runaway_line_is_discarded() {
        let mut assembler = FrameAssembler::default();
        assembler.push(&vec![b'x'; MAX_LINE_LEN + 1]);
        assembler.push(b"ok\n");
        assert_eq!(assembler.next_line().as_deref(), Some("ok"));
    }
}
