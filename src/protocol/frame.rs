//! Frame struct and constructors for each frame type.
//!
//! Uses `bytes::Bytes` for zero-copy payload sharing.
//!
//! # Example
//!
//! ```
//! use muxwire::protocol::{flags, Frame, FrameType};
//! use bytes::Bytes;
//!
//! let frame = Frame::data(1, flags::SYN, Bytes::from_static(b"hello"));
//! assert_eq!(frame.header.frame_type, FrameType::Data);
//! assert_eq!(frame.header.length, 5);
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{FrameType, Header, HEADER_SIZE, SESSION_STREAM_ID};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes; empty for everything but Data.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Data frame carrying `payload` on `stream_id`.
    pub fn data(stream_id: u32, flags: u16, payload: Bytes) -> Self {
        let header = Header::new(FrameType::Data, flags, stream_id, payload.len() as u32);
        Self { header, payload }
    }

    /// WindowUpdate granting `delta` more bytes of send credit.
    ///
    /// Also used with a zero delta to carry SYN/ACK/FIN/RST on their own.
    pub fn window_update(stream_id: u32, flags: u16, delta: u32) -> Self {
        Self::control(Header::new(FrameType::WindowUpdate, flags, stream_id, delta))
    }

    /// Ping with an opaque value; SYN to ask, ACK to answer.
    pub fn ping(flags: u16, value: u32) -> Self {
        Self::control(Header::new(FrameType::Ping, flags, SESSION_STREAM_ID, value))
    }

    /// GoAway with one of the [`go_away`](super::go_away) codes.
    pub fn go_away(code: u32) -> Self {
        Self::control(Header::new(FrameType::GoAway, 0, SESSION_STREAM_ID, code))
    }

    fn control(header: Header) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Get the stream id.
    #[inline]
    pub fn stream_id(&self) -> u32 {
        self.header.stream_id
    }

    /// Total encoded size of this frame (header + payload).
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Build a complete frame as a single byte vector.
///
/// Encodes header and appends payload into a contiguous buffer. The session
/// itself writes header and payload as separate slices; this is for tests
/// and tools that need the raw wire bytes.
///
/// # Example
///
/// ```
/// use muxwire::protocol::{build_frame, Frame, HEADER_SIZE};
/// use bytes::Bytes;
///
/// let bytes = build_frame(&Frame::data(3, 0, Bytes::from_static(b"hello")));
/// assert_eq!(bytes.len(), HEADER_SIZE + 5);
/// ```
pub fn build_frame(frame: &Frame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(frame.encoded_len());
    buf.extend_from_slice(&frame.header.encode());
    buf.extend_from_slice(&frame.payload);
    buf
}
