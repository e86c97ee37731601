//! Wire format encoding and decoding.
//!
//! Implements the 12-byte frame header:
//! ```text
//! ┌─────────┬──────┬────────┬───────────┬──────────┐
//! │ Version │ Type │ Flags  │ Stream ID │ Length   │
//! │ 1 byte  │1 byte│ 2 bytes│ 4 bytes   │ 4 bytes  │
//! │         │      │ u16 BE │ u32 BE    │ u32 BE   │
//! └─────────┴──────┴────────┴───────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. `Length` is the payload size for
//! Data frames, the window delta for WindowUpdate, an opaque echo value for
//! Ping and an error code for GoAway. Only Data frames carry a payload.

use crate::error::{Error, Result};

/// Header size in bytes (fixed, exactly 12).
pub const HEADER_SIZE: usize = 12;

/// The only protocol version spoken.
pub const PROTOCOL_VERSION: u8 = 0;

/// Stream id reserved for session-level frames (Ping, GoAway).
pub const SESSION_STREAM_ID: u32 = 0;

/// Default maximum Data payload accepted in a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame flag bits.
pub mod flags {
    /// Opens a new stream (or starts a ping).
    pub const SYN: u16 = 0x0001;
    /// Acknowledges a stream open (or answers a ping).
    pub const ACK: u16 = 0x0002;
    /// Half-closes the sender's direction.
    pub const FIN: u16 = 0x0004;
    /// Aborts the stream.
    pub const RST: u16 = 0x0008;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u16, flag: u16) -> bool {
        flags & flag != 0
    }
}

/// GoAway error codes carried in the length field.
pub mod go_away {
    /// Normal termination.
    pub const NORMAL: u32 = 0;
    /// The sender saw a protocol error.
    pub const PROTOCOL_ERROR: u32 = 1;
    /// The sender hit an internal error.
    pub const INTERNAL_ERROR: u32 = 2;
}

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Stream payload.
    Data = 0,
    /// Send-window credit for a stream.
    WindowUpdate = 1,
    /// Liveness and RTT check (session-level).
    Ping = 2,
    /// Session shutdown notice (session-level).
    GoAway = 3,
}

impl FrameType {
    /// Whether frames of this type must use stream id 0.
    #[inline]
    pub fn is_session_level(self) -> bool {
        matches!(self, FrameType::Ping | FrameType::GoAway)
    }
}

impl TryFrom<u8> for FrameType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::WindowUpdate),
            2 => Ok(FrameType::Ping),
            3 => Ok(FrameType::GoAway),
            other => Err(Error::protocol(format!("unknown frame type {}", other))),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Protocol version (always [`PROTOCOL_VERSION`] once decoded).
    pub version: u8,
    /// Frame type.
    pub frame_type: FrameType,
    /// Flag bits (see [`flags`]).
    pub flags: u16,
    /// Stream identifier, 0 for session-level frames.
    pub stream_id: u32,
    /// Payload length, window delta, ping value or GoAway code.
    pub length: u32,
}

impl Header {
    /// Create a new header with the current protocol version.
    pub fn new(frame_type: FrameType, flags: u16, stream_id: u32, length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            flags,
            stream_id,
            length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use muxwire::protocol::{flags, FrameType, Header, HEADER_SIZE};
    ///
    /// let header = Header::new(FrameType::Data, flags::SYN, 1, 5);
    /// let bytes = header.encode();
    /// assert_eq!(bytes.len(), HEADER_SIZE);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (12 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0] = self.version;
        buf[1] = self.frame_type as u8;
        buf[2..4].copy_from_slice(&self.flags.to_be_bytes());
        buf[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` while fewer than [`HEADER_SIZE`] bytes are
    /// available. A wrong version, an unknown type or a stream id that does
    /// not fit the frame type is an error.
    ///
    /// # Example
    ///
    /// ```
    /// use muxwire::protocol::{FrameType, Header};
    ///
    /// let bytes = [0, 0, 0, 1, 0, 0, 0, 3, 0, 0, 0, 10];
    /// let header = Header::decode(&bytes).unwrap().unwrap();
    /// assert_eq!(header.frame_type, FrameType::Data);
    /// assert_eq!(header.stream_id, 3);
    /// assert_eq!(header.length, 10);
    ///
    /// assert!(Header::decode(&bytes[..4]).unwrap().is_none());
    /// ```
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        let Some(raw) = buf.get(..HEADER_SIZE) else {
            return Ok(None);
        };

        if raw[0] != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                found: raw[0],
            });
        }

        let header = Self {
            version: raw[0],
            frame_type: FrameType::try_from(raw[1])?,
            flags: u16::from_be_bytes([raw[2], raw[3]]),
            stream_id: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
            length: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
        };

        header.check_stream_id()?;
        Ok(Some(header))
    }

    fn check_stream_id(&self) -> Result<()> {
        let session_level = self.frame_type.is_session_level();
        if session_level && self.stream_id != SESSION_STREAM_ID {
            return Err(Error::protocol(format!(
                "{:?} frame on stream {} (must be 0)",
                self.frame_type, self.stream_id
            )));
        }
        if !session_level && self.stream_id == SESSION_STREAM_ID {
            return Err(Error::protocol(format!(
                "{:?} frame on reserved stream 0",
                self.frame_type
            )));
        }
        Ok(())
    }

    /// Validate the header for protocol compliance.
    ///
    /// Checks:
    /// - Stream id fits the frame type
    /// - Data payload length doesn't exceed `max_frame_size`
    pub fn validate(&self, max_frame_size: u32) -> Result<()> {
        self.check_stream_id()?;

        if self.frame_type == FrameType::Data && self.length > max_frame_size {
            return Err(Error::protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.length, max_frame_size
            )));
        }

        Ok(())
    }

    /// Number of payload bytes following this header on the wire.
    #[inline]
    pub fn payload_len(&self) -> u32 {
        match self.frame_type {
            FrameType::Data => self.length,
            _ => 0,
        }
    }

    /// Check if the SYN flag is set.
    #[inline]
    pub fn is_syn(&self) -> bool {
        flags::has_flag(self.flags, flags::SYN)
    }

    /// Check if the ACK flag is set.
    #[inline]
    pub fn is_ack(&self) -> bool {
        flags::has_flag(self.flags, flags::ACK)
    }

    /// Check if the FIN flag is set.
    #[inline]
    pub fn is_fin(&self) -> bool {
        flags::has_flag(self.flags, flags::FIN)
    }

    /// Check if the RST flag is set.
    #[inline]
    pub fn is_rst(&self) -> bool {
        flags::has_flag(self.flags, flags::RST)
    }
}
