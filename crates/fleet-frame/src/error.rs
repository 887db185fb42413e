//! Error types for frame decoding

use thiserror::Error;

use crate::types::CloseCode;

/// Errors that can occur while decoding frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes for the declared frame yet; wait for more data
    #[error("incomplete frame: need {needed} bytes, have {available}")]
    Incomplete { needed: usize, available: usize },

    /// RSV1-3 set without a negotiated extension
    #[error("reserved bits set: 0x{0:02X}")]
    ReservedBits(u8),

    /// Opcode outside the defined set
    #[error("unknown opcode: 0x{0:X}")]
    UnknownOpcode(u8),

    /// 64-bit length with the most significant bit set, or too large for this platform
    #[error("frame length overflow: {0}")]
    LengthOverflow(u64),

    /// Control frames must not be fragmented
    #[error("fragmented control frame")]
    FragmentedControl,

    /// Control frame payload above 125 bytes
    #[error("control frame payload too long: {0} bytes")]
    ControlTooLong(u64),

    /// Continuation frame without a preceding fragment
    #[error("continuation frame without an open message")]
    UnexpectedContinuation,

    /// New text/binary frame while a fragmented message is still open
    #[error("data frame interleaved with an open fragmented message")]
    InterleavedDataFrame,

    /// Message exceeds the configured limit
    #[error("message too large: {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: u64, limit: usize },
}

impl FrameError {
    /// Whether more bytes could turn this error into a valid frame
    pub fn is_incomplete(&self) -> bool {
        matches!(self, FrameError::Incomplete { .. })
    }

    /// Close code to send to the peer when terminating for this error
    pub fn close_code(&self) -> CloseCode {
        match self {
            FrameError::MessageTooLarge { .. } => CloseCode::TooBig,
            _ => CloseCode::Protocol,
        }
    }
}

/// Result type for frame operations
pub type FrameResult<T> = Result<T, FrameError>;
