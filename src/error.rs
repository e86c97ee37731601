//! Error types for muxwire.
//!
//! Stream-level failures ([`Error::StreamReset`], [`Error::StreamClosed`],
//! [`Error::Timeout`]) only affect the stream or call that produced them.
//! Session-level failures ([`Error::ProtocolViolation`],
//! [`Error::VersionMismatch`], [`Error::TransportClosed`], [`Error::Io`])
//! terminate the session and are handed to every open stream.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Main error type for all muxwire operations.
///
/// `Clone` so that a single fatal cause can be delivered to every stream.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The peer broke the framing rules (bad header, id reuse, oversized frame).
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer speaks a different protocol version.
    #[error("Protocol version mismatch: expected {expected}, got {found}")]
    VersionMismatch {
        /// Version this implementation speaks.
        expected: u8,
        /// Version found in the received header.
        found: u8,
    },

    /// The transport reached end-of-file or the session was torn down.
    #[error("Transport closed")]
    TransportClosed,

    /// The stream was reset by either side.
    #[error("Stream reset")]
    StreamReset,

    /// The stream is closed for the attempted direction.
    #[error("Stream closed")]
    StreamClosed,

    /// A ping (or keepalive) did not get an answer in time.
    #[error("Operation timed out")]
    Timeout,

    /// The local side closed or aborted the session.
    #[error("Session shut down")]
    SessionShutdown,

    /// The peer sent GoAway; no new streams can be opened.
    #[error("Remote sent GoAway (code {0})")]
    RemoteGoAway(u32),

    /// All stream ids of the local parity have been used.
    #[error("Stream ids exhausted")]
    StreamsExhausted,
}

impl Error {
    /// Recover the muxwire error carried inside an I/O error returned by a
    /// [`Stream`](crate::Stream) read or write.
    ///
    /// I/O errors that did not originate in muxwire are wrapped as [`Error::Io`].
    pub fn from_io_error(err: io::Error) -> Self {
        if err.get_ref().map(|e| e.is::<Error>()).unwrap_or(false) {
            if let Some(inner) = err.into_inner() {
                if let Ok(e) = inner.downcast::<Error>() {
                    return *e;
                }
            }
            return Error::TransportClosed;
        }
        Error::Io(Arc::new(err))
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Io(e) => e.kind(),
            Error::StreamReset => io::ErrorKind::ConnectionReset,
            Error::StreamClosed => io::ErrorKind::BrokenPipe,
            Error::Timeout => io::ErrorKind::TimedOut,
            Error::ProtocolViolation(_) | Error::VersionMismatch { .. } => {
                io::ErrorKind::InvalidData
            }
            Error::TransportClosed
            | Error::SessionShutdown
            | Error::RemoteGoAway(_)
            | Error::StreamsExhausted => io::ErrorKind::ConnectionAborted,
        };
        io::Error::new(kind, err)
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_roundtrip_keeps_variant() {
        let io_err: io::Error = Error::StreamReset.into();
        assert_eq!(io_err.kind(), io::ErrorKind::ConnectionReset);
        assert!(matches!(Error::from_io_error(io_err), Error::StreamReset));

        let io_err: io::Error = Error::protocol("bad type").into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        match Error::from_io_error(io_err) {
            Error::ProtocolViolation(msg) => assert_eq!(msg, "bad type"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_foreign_io_error_is_wrapped() {
        let err = Error::from_io_error(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(matches!(err, Error::Io(_)));
    }
}
