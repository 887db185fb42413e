//! fleet-frame - WebSocket framing for the fleet telemetry relay
//!
//! The relay speaks the WebSocket protocol to its downstream viewers
//! without a generic upgrade or framing library. This crate holds the
//! protocol-level pieces as pure functions, free of any socket I/O:
//!
//! - [`encode_frame`] / [`encode_masked_frame`] - build one frame
//! - [`decode_frame`] - parse at most one frame from a byte slice
//! - [`accept_key`] - the `Sec-WebSocket-Accept` value for a handshake key
//! - [`FrameReader`] - buffers socket chunks and yields whole messages,
//!   reassembling fragmented ones
//!
//! # Quick Start
//!
//! ```rust
//! use fleet_frame::{decode_frame, encode_frame, Opcode};
//!
//! let bytes = encode_frame(b"{\"positions\":[]}", Opcode::Text);
//! let decoded = decode_frame(&bytes).unwrap();
//!
//! assert_eq!(decoded.frame.opcode, Opcode::Text);
//! assert_eq!(decoded.frame.payload, b"{\"positions\":[]}");
//! assert_eq!(decoded.consumed, bytes.len());
//! ```
//!
//! # Length encoding
//!
//! | Payload length | Length field |
//! |----------------|--------------|
//! | 0..=125 | inline in the 7-bit field |
//! | 126..=65535 | `126`, then a 16-bit big-endian length |
//! | 65536.. | `127`, then two 32-bit big-endian words (high, low) |

mod decode;
mod encode;
mod error;
mod handshake;
mod reader;
mod types;

pub use decode::{decode_frame, decode_header, DecodedFrame};
pub use encode::{close_payload, encode_close, encode_frame, encode_masked_frame, encode_text};
pub use error::{FrameError, FrameResult};
pub use handshake::{accept_key, WEBSOCKET_GUID};
pub use reader::{FrameReader, Message};
pub use types::{close_code, CloseCode, Frame, FrameHeader, Opcode, MAX_CONTROL_PAYLOAD};
