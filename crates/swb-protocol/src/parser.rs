//! Line framing for the byte stream of a connection

use bytes::BytesMut;
use swb_core::Payload;
use tracing::warn;

use crate::codec::decode;
use crate::error::{ProtocolError, ProtocolResult};

/// Maximum line length (64KB)
pub const MAX_LINE_SIZE: usize = 64 * 1024;

/// Splits incoming bytes into payloads, one per line
pub struct Parser {
    buffer: BytesMut,
    max_line: usize,
    /// Skipping the tail of an oversized line
    discarding: bool,
}

impl Parser {
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_SIZE)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_line,
            discarding: false,
        }
    }

    /// Add data to the parser buffer.
    ///
    /// An unterminated line longer than the limit is dropped and reported
    /// once; the rest of that line is skipped when it arrives.
    pub fn feed(&mut self, mut data: &[u8]) -> ProtocolResult<()> {
        if self.discarding {
            match data.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.discarding = false;
                    data = &data[pos + 1..];
                }
                None => return Ok(()),
            }
        }

        self.buffer.extend_from_slice(data);

        let unterminated = match self.buffer.iter().rposition(|&b| b == b'\n') {
            Some(pos) => self.buffer.len() - pos - 1,
            None => self.buffer.len(),
        };
        if unterminated > self.max_line {
            let keep = self.buffer.len() - unterminated;
            self.buffer.truncate(keep);
            self.discarding = true;
            warn!(size = unterminated, max = self.max_line, "Discarding oversized line");
            return Err(ProtocolError::MessageTooLarge {
                size: unterminated,
                max: self.max_line,
            });
        }
        Ok(())
    }

    /// Take the next complete line as a payload
    pub fn next_payload(&mut self) -> Option<Payload> {
        let line_end = self.buffer.iter().position(|&b| b == b'\n')?;
        let line = self.buffer.split_to(line_end + 1);

        let mut len = line_end;
        if len > 0 && line[len - 1] == b'\r' {
            len -= 1;
        }

        let payload = match std::str::from_utf8(&line[..len]) {
            Ok(text) => decode(text),
            Err(_) => Payload::ping(),
        };
        Some(payload)
    }

    /// Drain every complete line currently buffered
    pub fn drain(&mut self) -> Vec<Payload> {
        std::iter::from_fn(|| self.next_payload()).collect()
    }

    /// Bytes held for an incomplete line
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_line;
    use swb_core::PING;

    #[test]
    fn test_incomplete_line() {
        let mut parser = Parser::new();
        parser.feed(br#"{"action":"Kno"#).unwrap();
        assert!(parser.next_payload().is_none());

        parser.feed(b"ckKnock\"}\r\n").unwrap();
        let payload = parser.next_payload().unwrap();
        assert_eq!(payload.action(), Some("KnockKnock"));
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_multiple_lines_in_one_read() {
        let mut parser = Parser::new();
        let mut data = encode_line(&Payload::request("A"));
        data.extend(encode_line(&Payload::request("B")));
        data.extend(b"???\n");
        parser.feed(&data).unwrap();

        let actions: Vec<_> = parser
            .drain()
            .iter()
            .map(|p| p.effective_action().to_string())
            .collect();
        assert_eq!(actions, vec!["A", "B", PING]);
    }

    #[test]
    fn test_invalid_utf8_is_ping() {
        let mut parser = Parser::new();
        parser.feed(&[0xff, 0xfe, b'\n']).unwrap();
        assert!(parser.next_payload().unwrap().is_ping());
    }

    #[test]
    fn test_oversized_line_is_discarded() {
        let mut parser = Parser::with_max_line(16);
        assert!(matches!(
            parser.feed(&[b'x'; 20]),
            Err(ProtocolError::MessageTooLarge { size: 20, max: 16 })
        ));
        assert_eq!(parser.buffered(), 0);

        // Tail of the oversized line is skipped, the next line survives
        parser.feed(b"yyyy\n{\"action\":\"On\"}\n").unwrap();
        let payload = parser.next_payload().unwrap();
        assert_eq!(payload.action(), Some("On"));
        assert!(parser.next_payload().is_none());
    }
}
