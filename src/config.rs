//! Session configuration.
//!
//! All fields have defaults; setters follow the builder style so a config
//! can be assembled inline:
//!
//! ```
//! use std::time::Duration;
//! use muxwire::Config;
//!
//! let config = Config::default()
//!     .with_initial_stream_window(512 * 1024)
//!     .with_ping_timeout(Duration::from_secs(3));
//! assert_eq!(config.initial_stream_window, 512 * 1024);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

/// Default per-stream window (256 KiB), in both directions.
pub const DEFAULT_STREAM_WINDOW: u32 = 256 * 1024;

/// Default number of inbound streams waiting for `accept_stream()`.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 256;

/// Default time to wait for a ping answer.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Default transport read size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of unwritten control replies before the peer is treated as
/// not reading.
pub const DEFAULT_MAX_PENDING_REPLIES: usize = 1024;

/// Tunables for a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Starting send and receive window of every stream. Both peers must use
    /// the same value.
    pub initial_stream_window: u32,
    /// Largest Data payload accepted in, or produced for, a single frame.
    pub max_frame_size: u32,
    /// Inbound streams that may wait for `accept_stream()` before new ones
    /// are refused with RST.
    pub accept_backlog: usize,
    /// How long `ping()` waits for the matching answer.
    pub ping_timeout: Duration,
    /// Interval of automatic pings; `None` disables keepalive.
    pub keepalive_interval: Option<Duration>,
    /// Size of each read from the transport.
    pub read_buffer_size: usize,
    /// Ping answers and RSTs produced by the reader that may wait for the
    /// writer. Past this the session fails with a protocol violation.
    pub max_pending_replies: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_stream_window: DEFAULT_STREAM_WINDOW,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            keepalive_interval: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_pending_replies: DEFAULT_MAX_PENDING_REPLIES,
        }
    }
}

impl Config {
    /// Set the initial per-stream window.
    ///
    /// Default: 256 KiB
    pub fn with_initial_stream_window(mut self, window: u32) -> Self {
        self.initial_stream_window = window;
        self
    }

    /// Set the maximum Data payload per frame.
    ///
    /// Default: 16 MiB
    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the accept backlog.
    ///
    /// Default: 256
    pub fn with_accept_backlog(mut self, backlog: usize) -> Self {
        self.accept_backlog = backlog;
        self
    }

    /// Set the ping timeout.
    ///
    /// Default: 10 seconds
    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Enable keepalive pings at `interval`.
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    /// Set the transport read size.
    ///
    /// Default: 64 KiB
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the limit of control replies waiting for the writer.
    ///
    /// Default: 1024
    pub fn with_max_pending_replies(mut self, limit: usize) -> Self {
        self.max_pending_replies = limit;
        self
    }

    /// Largest chunk a single Data frame may carry.
    pub(crate) fn frame_chunk_limit(&self) -> usize {
        self.max_frame_size.max(1) as usize
    }
}
