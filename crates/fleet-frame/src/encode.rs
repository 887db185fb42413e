//! Encoding payloads into frames
//!
//! Frames written by the relay are always final (FIN set) and never masked.
//! The masked variant exists for client-side use, mainly in tests.

use crate::types::{CloseCode, Opcode, MAX_CONTROL_PAYLOAD};

const FIN: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

/// Encode a single unmasked, final frame
pub fn encode_frame(payload: &[u8], opcode: Opcode) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    write_header(&mut out, opcode, payload.len(), false);
    out.extend_from_slice(payload);
    out
}

/// Encode a text frame
pub fn encode_text(text: &str) -> Vec<u8> {
    encode_frame(text.as_bytes(), Opcode::Text)
}

/// Encode a single masked, final frame (client-to-server direction)
pub fn encode_masked_frame(payload: &[u8], opcode: Opcode, mask: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    write_header(&mut out, opcode, payload.len(), true);
    out.extend_from_slice(&mask);
    out.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ mask[i % 4]),
    );
    out
}

/// Build a close frame payload: status code followed by a UTF-8 reason.
///
/// The reason is truncated on a character boundary so the payload stays
/// within the control frame limit.
pub fn close_payload(code: CloseCode, reason: &str) -> Vec<u8> {
    let mut payload = u16::from(code).to_be_bytes().to_vec();
    let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

/// Encode a close frame
pub fn encode_close(code: CloseCode, reason: &str) -> Vec<u8> {
    encode_frame(&close_payload(code, reason), Opcode::Close)
}

fn write_header(out: &mut Vec<u8>, opcode: Opcode, len: usize, masked: bool) {
    out.push(FIN | opcode.as_u8());
    let mask_bit = if masked { MASK_BIT } else { 0 };

    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        // 64-bit length written as two 32-bit big-endian words
        let len = len as u64;
        out.push(mask_bit | 127);
        out.extend_from_slice(&((len >> 32) as u32).to_be_bytes());
        out.extend_from_slice(&(len as u32).to_be_bytes());
    }
}
