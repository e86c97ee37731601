//! # muxwire
//!
//! Stream multiplexing over a single ordered byte transport.
//!
//! A [`Session`] runs over any `AsyncRead + AsyncWrite` transport (a TCP
//! stream, an in-memory duplex, a secure-channel wrapper) and carries many
//! independent, flow-controlled [`Stream`]s on it.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): 12-byte big-endian header
//!   (`version | type | flags | stream_id | length`) followed by a payload
//!   for Data frames only
//! - **Streams** ([`stream`]): SYN/ACK open handshake, FIN half-close, RST
//!   abort, per-stream send and receive windows
//! - **Session** ([`session`]): one reader task dispatching inbound frames,
//!   one writer task serializing outbound frames, Ping and GoAway handling
//!
//! ## Example
//!
//! ```ignore
//! use muxwire::{Config, Session};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! #[tokio::main]
//! async fn main() -> muxwire::Result<()> {
//!     let (a, b) = tokio::io::duplex(64 * 1024);
//!     let client = Session::client(a, Config::default());
//!     let server = Session::server(b, Config::default());
//!
//!     let mut out = client.open_stream()?;
//!     out.write_all(b"hello").await?;
//!     out.shutdown().await?;
//!
//!     let mut inbound = server.accept_stream().await?;
//!     let mut buf = Vec::new();
//!     inbound.read_to_end(&mut buf).await?;
//!     assert_eq!(buf, b"hello");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod flow;
pub mod protocol;
pub mod session;
pub mod stream;

mod writer;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{Mode, Session};
pub use stream::{Stream, StreamId, StreamState};
