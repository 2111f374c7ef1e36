//! Incremental frame decoder
//!
//! Bytes read from a socket are fed into a [`FrameParser`], which yields
//! complete frames as they become available. A frame starting with a NUL
//! byte is a binary packet; anything else is a newline-terminated admin
//! command line.

use super::packet::{Magic, Packet, PacketType, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use crate::error::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};

/// A decoded frame of either protocol family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Binary packet
    Packet(Packet),
    /// One admin text line, without the line terminator
    Text(String),
}

impl Frame {
    /// Encode to wire bytes. Text frames are terminated with `\n`.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Packet(packet) => packet.encode(),
            Frame::Text(text) => {
                let mut buf = BytesMut::with_capacity(text.len() + 1);
                buf.extend_from_slice(text.as_bytes());
                if !text.ends_with('\n') {
                    buf.extend_from_slice(b"\n");
                }
                buf.freeze()
            }
        }
    }
}

impl From<Packet> for Frame {
    fn from(packet: Packet) -> Self {
        Frame::Packet(packet)
    }
}

/// Frame parser over a growable buffer
#[allow(clippy::module_name_repetitions)]
pub struct FrameParser {
    buffer: BytesMut,
    max_payload_size: u32,
}

impl FrameParser {
    /// Create a parser with the default payload limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a parser with a custom payload limit
    #[must_use]
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_payload_size,
        }
    }

    /// Add data to the parser buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered, not yet decoded bytes
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to parse one complete frame from the buffer
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for a bad magic or unknown packet type, and
    /// `MessageTooLarge` when a length field or admin line exceeds the limit.
    /// The buffer is left as-is after an error; callers must drop the connection.
    pub fn parse(&mut self) -> Result<Option<Frame>> {
        match self.buffer.first() {
            None => Ok(None),
            Some(0) => self.parse_packet(),
            Some(_) => self.parse_line(),
        }
    }

    fn parse_packet(&mut self) -> Result<Option<Frame>> {
        // Reject a bad magic as soon as its bytes arrive
        let magic_len = self.buffer.len().min(4);
        if !super::packet::REQ_MAGIC.starts_with(&self.buffer[..magic_len])
            && !super::packet::RES_MAGIC.starts_with(&self.buffer[..magic_len])
        {
            return Err(Error::Protocol(format!(
                "Invalid magic: {:02x?}",
                &self.buffer[..magic_len]
            )));
        }

        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = Magic::from_bytes(&self.buffer[0..4])?;
        let code = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]);
        let length = u32::from_be_bytes([
            self.buffer[8],
            self.buffer[9],
            self.buffer[10],
            self.buffer[11],
        ]);

        // Security: Check size limit before waiting for the payload
        if length > self.max_payload_size {
            return Err(Error::MessageTooLarge);
        }
        let ptype = PacketType::from_code(code)?;

        let total = HEADER_SIZE + length as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        self.buffer.advance(HEADER_SIZE);
        let data = self.buffer.split_to(length as usize).freeze();
        Ok(Some(Frame::Packet(Packet { magic, ptype, data })))
    }

    fn parse_line(&mut self) -> Result<Option<Frame>> {
        let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
            // Security: Prevent unbounded line buffering
            if self.buffer.len() > self.max_payload_size as usize {
                return Err(Error::MessageTooLarge);
            }
            return Ok(None);
        };

        if pos > self.max_payload_size as usize {
            return Err(Error::MessageTooLarge);
        }

        let line = self.buffer.split_to(pos + 1);
        let mut line = &line[..pos];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }

        let text = std::str::from_utf8(line)
            .map_err(|_| Error::Protocol("Invalid UTF-8 in admin command".to_string()))?;
        Ok(Some(Frame::Text(text.to_string())))
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_packet() {
        let mut parser = FrameParser::new();
        let packet = Packet::request(PacketType::CanDo, &[b"test"]);
        parser.feed(&packet.encode());

        let frame = parser.parse().unwrap().unwrap();
        assert_eq!(frame, Frame::Packet(packet));
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_parse_fragmented_packet() {
        let mut parser = FrameParser::new();
        let packet = Packet::request(PacketType::SubmitJob, &[b"test", b"", b"testdata"]);
        let bytes = packet.encode();

        parser.feed(&bytes[..5]);
        assert!(parser.parse().unwrap().is_none());
        parser.feed(&bytes[5..13]);
        assert!(parser.parse().unwrap().is_none(), "Should wait for payload");
        parser.feed(&bytes[13..]);

        let frame = parser.parse().unwrap().unwrap();
        assert_eq!(frame, Frame::Packet(packet));
    }

    #[test]
    fn test_parse_back_to_back_frames() {
        let mut parser = FrameParser::new();
        let first = Packet::request(PacketType::GrabJobUniq, &[]);
        let second = Packet::request(PacketType::PreSleep, &[]);
        parser.feed(&first.encode());
        parser.feed(&second.encode());
        parser.feed(b"status\r\n");

        assert_eq!(parser.parse().unwrap(), Some(Frame::Packet(first)));
        assert_eq!(parser.parse().unwrap(), Some(Frame::Packet(second)));
        assert_eq!(
            parser.parse().unwrap(),
            Some(Frame::Text("status".to_string()))
        );
        assert_eq!(parser.parse().unwrap(), None);
    }

    #[test]
    fn test_bad_magic_rejected_early() {
        let mut parser = FrameParser::new();
        parser.feed(b"\0RX");
        assert!(matches!(parser.parse(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut parser = FrameParser::new();
        parser.feed(b"\0REQ\0\0\0\x63\0\0\0\0");
        assert!(matches!(parser.parse(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_length_limit() {
        let mut parser = FrameParser::with_max_payload(16);
        parser.feed(b"\0REQ\0\0\0\x07\0\0\0\x11");
        assert!(matches!(parser.parse(), Err(Error::MessageTooLarge)));
    }

    #[test]
    fn test_admin_line_limit() {
        let mut parser = FrameParser::with_max_payload(8);
        parser.feed(b"workers workers");
        assert!(matches!(parser.parse(), Err(Error::MessageTooLarge)));
    }

    #[test]
    fn test_incomplete_admin_line() {
        let mut parser = FrameParser::new();
        parser.feed(b"stat");
        assert!(parser.parse().unwrap().is_none());
        parser.feed(b"us\n");
        assert_eq!(
            parser.parse().unwrap(),
            Some(Frame::Text("status".to_string()))
        );
    }

    #[test]
    fn test_text_frame_encode() {
        assert_eq!(&Frame::Text("OK".to_string()).encode()[..], b"OK\n");
        assert_eq!(&Frame::Text(".\n".to_string()).encode()[..], b".\n");
    }
}
