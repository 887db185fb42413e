//! Incremental message reader
//!
//! Socket reads arrive in arbitrary chunks. [`FrameReader`] accumulates
//! them and hands out complete messages: control frames as they arrive,
//! data messages once their final fragment has been seen.

use bytes::{Buf, BytesMut};

use crate::decode::{decode_frame, decode_header};
use crate::error::{FrameError, FrameResult};
use crate::types::{Opcode, MAX_CONTROL_PAYLOAD};

/// A complete message read from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Text, Binary, Close, Ping or Pong; never Continuation
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    /// Whether the (first) frame carried a masking key
    pub masked: bool,
}

impl Message {
    /// Payload as UTF-8 text, if valid
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Fragmented data message under reassembly
#[derive(Debug)]
struct Partial {
    opcode: Opcode,
    payload: Vec<u8>,
    masked: bool,
}

/// Buffers incoming bytes and yields whole messages
#[derive(Debug)]
pub struct FrameReader {
    buffer: BytesMut,
    partial: Option<Partial>,
    max_message: usize,
}

impl FrameReader {
    /// Create a reader that rejects data messages above `max_message` bytes
    pub fn new(max_message: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            partial: None,
            max_message,
        }
    }

    /// Append bytes read from the socket
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete message out of the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed. Any error is fatal for
    /// the connection; the reader should not be used afterwards.
    pub fn next_message(&mut self) -> FrameResult<Option<Message>> {
        loop {
            // Check the declared size before the whole payload is buffered
            // so an oversized frame is rejected without waiting for it.
            let header = match decode_header(&self.buffer) {
                Ok(header) => header,
                Err(e) if e.is_incomplete() => return Ok(None),
                Err(e) => return Err(e),
            };

            if header.opcode.is_control() {
                if !header.fin {
                    return Err(FrameError::FragmentedControl);
                }
                if header.payload_len > MAX_CONTROL_PAYLOAD as u64 {
                    return Err(FrameError::ControlTooLong(header.payload_len));
                }
            } else {
                let open = self.partial.as_ref().map_or(0, |p| p.payload.len() as u64);
                let size = open.saturating_add(header.payload_len);
                if size > self.max_message as u64 {
                    return Err(FrameError::MessageTooLarge {
                        size,
                        limit: self.max_message,
                    });
                }
            }

            let decoded = match decode_frame(&self.buffer) {
                Ok(decoded) => decoded,
                Err(e) if e.is_incomplete() => return Ok(None),
                Err(e) => return Err(e),
            };
            self.buffer.advance(decoded.consumed);
            let frame = decoded.frame;
            let masked = header.mask.is_some();

            match frame.opcode {
                Opcode::Close | Opcode::Ping | Opcode::Pong => {
                    return Ok(Some(Message {
                        opcode: frame.opcode,
                        payload: frame.payload,
                        masked,
                    }));
                }
                Opcode::Continuation => {
                    let mut partial = self
                        .partial
                        .take()
                        .ok_or(FrameError::UnexpectedContinuation)?;
                    partial.payload.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return Ok(Some(Message {
                            opcode: partial.opcode,
                            payload: partial.payload,
                            masked: partial.masked,
                        }));
                    }
                    self.partial = Some(partial);
                }
                Opcode::Text | Opcode::Binary => {
                    if self.partial.is_some() {
                        return Err(FrameError::InterleavedDataFrame);
                    }
                    if frame.fin {
                        return Ok(Some(Message {
                            opcode: frame.opcode,
                            payload: frame.payload,
                            masked,
                        }));
                    }
                    self.partial = Some(Partial {
                        opcode: frame.opcode,
                        payload: frame.payload,
                        masked,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{close_payload, encode_masked_frame};
    use crate::types::CloseCode;
    use pretty_assertions::assert_eq;

    const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    fn masked(opcode: Opcode, fin: bool, payload: &[u8]) -> Vec<u8> {
        let mut bytes = encode_masked_frame(payload, opcode, MASK);
        if !fin {
            bytes[0] &= 0x7F;
        }
        bytes
    }

    #[test]
    fn test_reads_single_text_message() {
        let mut reader = FrameReader::new(1024);
        reader.push(&masked(Opcode::Text, true, b"hello"));

        let msg = reader.next_message().unwrap().unwrap();
        assert_eq!(msg.opcode, Opcode::Text);
        assert_eq!(msg.as_text(), Some("hello"));
        assert!(msg.masked);
        assert_eq!(reader.next_message().unwrap(), None);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_waits_for_split_frame() {
        let bytes = masked(Opcode::Text, true, b"split across reads");
        let mut reader = FrameReader::new(1024);

        reader.push(&bytes[..1]);
        assert_eq!(reader.next_message().unwrap(), None);
        reader.push(&bytes[1..7]);
        assert_eq!(reader.next_message().unwrap(), None);
        reader.push(&bytes[7..]);

        let msg = reader.next_message().unwrap().unwrap();
        assert_eq!(msg.as_text(), Some("split across reads"));
    }

    #[test]
    fn test_reassembles_fragments_around_ping() {
        let mut reader = FrameReader::new(1024);
        reader.push(&masked(Opcode::Text, false, b"frag"));
        reader.push(&masked(Opcode::Ping, true, b"p"));
        reader.push(&masked(Opcode::Continuation, false, b"men"));
        reader.push(&masked(Opcode::Continuation, true, b"ted"));

        let ping = reader.next_message().unwrap().unwrap();
        assert_eq!(ping.opcode, Opcode::Ping);
        assert_eq!(ping.payload, b"p");

        let text = reader.next_message().unwrap().unwrap();
        assert_eq!(text.opcode, Opcode::Text);
        assert_eq!(text.as_text(), Some("fragmented"));
    }

    #[test]
    fn test_close_message_carries_code() {
        let mut reader = FrameReader::new(1024);
        reader.push(&masked(
            Opcode::Close,
            true,
            &close_payload(CloseCode::Away, "bye"),
        ));

        let msg = reader.next_message().unwrap().unwrap();
        assert_eq!(msg.opcode, Opcode::Close);
        assert_eq!(crate::close_code(&msg.payload), Some(1001));
    }

    #[test]
    fn test_accepts_unmasked_frames() {
        let mut reader = FrameReader::new(1024);
        reader.push(&crate::encode::encode_text("plain"));
        let msg = reader.next_message().unwrap().unwrap();
        assert_eq!(msg.as_text(), Some("plain"));
        assert!(!msg.masked);
    }

    #[test]
    fn test_rejects_orphan_continuation() {
        let mut reader = FrameReader::new(1024);
        reader.push(&masked(Opcode::Continuation, true, b"x"));
        assert_eq!(
            reader.next_message(),
            Err(FrameError::UnexpectedContinuation)
        );
    }

    #[test]
    fn test_rejects_interleaved_data_frame() {
        let mut reader = FrameReader::new(1024);
        reader.push(&masked(Opcode::Text, false, b"a"));
        reader.push(&masked(Opcode::Text, true, b"b"));
        assert_eq!(reader.next_message(), Err(FrameError::InterleavedDataFrame));
    }

    #[test]
    fn test_rejects_fragmented_control() {
        let mut reader = FrameReader::new(1024);
        reader.push(&masked(Opcode::Ping, false, b"a"));
        assert_eq!(reader.next_message(), Err(FrameError::FragmentedControl));
    }

    #[test]
    fn test_rejects_long_control_payload() {
        let mut reader = FrameReader::new(1024);
        reader.push(&masked(Opcode::Ping, true, &[0u8; 126]));
        assert_eq!(reader.next_message(), Err(FrameError::ControlTooLong(126)));
    }

    #[test]
    fn test_rejects_oversized_message_from_header() {
        let mut reader = FrameReader::new(100);
        let bytes = masked(Opcode::Binary, true, &[0u8; 200]);
        // Header alone is enough to reject
        reader.push(&bytes[..8]);
        let err = reader.next_message().unwrap_err();
        assert_eq!(
            err,
            FrameError::MessageTooLarge {
                size: 200,
                limit: 100
            }
        );
        assert_eq!(err.close_code(), CloseCode::TooBig);
    }

    #[test]
    fn test_rejects_oversized_fragment_sum() {
        let mut reader = FrameReader::new(10);
        reader.push(&masked(Opcode::Text, false, b"123456"));
        reader.push(&masked(Opcode::Continuation, true, b"789012"));
        assert!(matches!(
            reader.next_message(),
            Err(FrameError::MessageTooLarge { size: 12, .. })
        ));
    }
}
