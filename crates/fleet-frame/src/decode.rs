//! Decoding frames from raw bytes
//!
//! Each call consumes at most one frame and never reassembles fragments;
//! [`FrameReader`](crate::FrameReader) builds on this for whole messages.

use crate::error::{FrameError, FrameResult};
use crate::types::{Frame, FrameHeader, Opcode};

/// A frame together with the number of input bytes it occupied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub frame: Frame,
    pub consumed: usize,
}

/// Parse the frame header at the start of `bytes`.
///
/// Returns [`FrameError::Incomplete`] when the header itself is not
/// fully available yet.
pub fn decode_header(bytes: &[u8]) -> FrameResult<FrameHeader> {
    let (b0, b1) = match bytes {
        [b0, b1, ..] => (*b0, *b1),
        _ => return Err(incomplete(2, bytes.len())),
    };

    let rsv = b0 & 0x70;
    if rsv != 0 {
        return Err(FrameError::ReservedBits(rsv));
    }

    let fin = b0 & 0x80 != 0;
    let opcode = Opcode::from_u8(b0 & 0x0F)?;
    let masked = b1 & 0x80 != 0;

    let (payload_len, mut offset) = match b1 & 0x7F {
        126 => {
            let field = bytes.get(2..4).ok_or_else(|| incomplete(4, bytes.len()))?;
            (u16::from_be_bytes([field[0], field[1]]) as u64, 4)
        }
        127 => {
            let field = bytes.get(2..10).ok_or_else(|| incomplete(10, bytes.len()))?;
            let high = u32::from_be_bytes([field[0], field[1], field[2], field[3]]) as u64;
            let low = u32::from_be_bytes([field[4], field[5], field[6], field[7]]) as u64;
            let len = (high << 32) | low;
            if len >> 63 != 0 {
                return Err(FrameError::LengthOverflow(len));
            }
            (len, 10)
        }
        inline => (inline as u64, 2),
    };

    let mask = if masked {
        let key = bytes
            .get(offset..offset + 4)
            .ok_or_else(|| incomplete(offset + 4, bytes.len()))?;
        offset += 4;
        Some([key[0], key[1], key[2], key[3]])
    } else {
        None
    };

    Ok(FrameHeader {
        fin,
        opcode,
        mask,
        payload_len,
        header_len: offset,
    })
}

/// Decode one frame from the start of `bytes`, unmasking its payload.
pub fn decode_frame(bytes: &[u8]) -> FrameResult<DecodedFrame> {
    let header = decode_header(bytes)?;

    let payload_len = usize::try_from(header.payload_len)
        .map_err(|_| FrameError::LengthOverflow(header.payload_len))?;
    let total = header
        .header_len
        .checked_add(payload_len)
        .ok_or(FrameError::LengthOverflow(header.payload_len))?;

    if bytes.len() < total {
        return Err(incomplete(total, bytes.len()));
    }

    let mut payload = bytes[header.header_len..total].to_vec();
    if let Some(mask) = header.mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    Ok(DecodedFrame {
        frame: Frame {
            fin: header.fin,
            opcode: header.opcode,
            payload,
        },
        consumed: total,
    })
}

fn incomplete(needed: usize, available: usize) -> FrameError {
    FrameError::Incomplete { needed, available }
}
