//! Core protocol types
//!
//! Opcodes, close codes and the decoded frame representation.

use crate::error::{FrameError, FrameResult};

/// Largest payload a control frame may carry
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continues a fragmented message
    Continuation = 0x0,
    /// UTF-8 text
    Text = 0x1,
    /// Binary payload
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping; the peer answers with a pong carrying the same payload
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> FrameResult<Self> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Control opcodes occupy 0x8..=0xF
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Opcode::Continuation => "continuation",
            Opcode::Text => "text",
            Opcode::Binary => "binary",
            Opcode::Close => "close",
            Opcode::Ping => "ping",
            Opcode::Pong => "pong",
        };
        f.write_str(s)
    }
}

/// Close status codes used by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    Away,
    /// 1002
    Protocol,
    /// 1009
    TooBig,
    /// 1011
    Error,
    /// Any other code
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1009 => CloseCode::TooBig,
            1011 => CloseCode::Error,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::TooBig => 1009,
            CloseCode::Error => 1011,
            CloseCode::Other(other) => other,
        }
    }
}

/// Read the status code from a close frame payload, if it carries one
pub fn close_code(payload: &[u8]) -> Option<u16> {
    match payload {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    pub opcode: Opcode,
    /// Masking key, present on client-to-server frames
    pub mask: Option<[u8; 4]>,
    /// Declared payload length
    pub payload_len: u64,
    /// Bytes taken by the header, including the masking key
    pub header_len: usize,
}

/// A single decoded frame, payload already unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}
