//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the multiplexer's binary framing:
//! - 12-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with per-type constructors

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    flags, go_away, FrameType, Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE, PROTOCOL_VERSION,
    SESSION_STREAM_ID,
};
