//! Logical streams multiplexed over a session.
//!
//! A [`Stream`] is a duplex byte channel implementing Tokio's
//! [`AsyncRead`] and [`AsyncWrite`]:
//!
//! - reads suspend until data is buffered, the peer half-closes (end of
//!   stream, `Ok(0)`), or the stream is reset / the session dies (error);
//! - writes send at most the current send window and suspend while it is
//!   exhausted, so `write_all` fragments large buffers into window-sized
//!   Data frames;
//! - `shutdown()` sends FIN (half-close); [`Stream::reset`] sends RST.
//!
//! Errors surface as `std::io::Error`s wrapping a crate [`Error`];
//! [`Error::from_io_error`] recovers it.
//!
//! # Example
//!
//! ```ignore
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! let mut stream = session.open_stream()?;
//! stream.write_all(b"ping").await?;
//! stream.shutdown().await?;
//!
//! let mut reply = Vec::new();
//! stream.read_to_end(&mut reply).await?;
//! ```

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll, Waker};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Error, Result};
use crate::flow::{RecvWindow, SendWindow};
use crate::protocol::{flags, Frame, FrameType};
use crate::session::Shared;
use crate::writer::FrameSender;

/// Stream identifier. Odd ids are opened by clients, even ids by servers.
pub type StreamId = u32;

/// Lifecycle of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    /// Created locally, SYN not yet queued.
    Init,
    /// Opened locally, waiting for the peer's ACK.
    SynSent,
    /// Opened by the peer; our first frame will carry ACK.
    SynReceived,
    /// Open in both directions.
    Established,
    /// We sent FIN; the peer may still send.
    LocalClosed,
    /// The peer sent FIN; we may still send.
    RemoteClosed,
    /// Both sides sent FIN.
    Closed,
    /// Aborted by RST (either side) or by session teardown.
    Reset,
}

impl StreamState {
    /// Whether this side may still send data.
    pub fn can_write(self) -> bool {
        matches!(
            self,
            Self::Init | Self::SynSent | Self::SynReceived | Self::Established | Self::RemoteClosed
        )
    }

    /// Whether the peer may still send data.
    pub fn can_receive(self) -> bool {
        matches!(
            self,
            Self::Init | Self::SynSent | Self::SynReceived | Self::Established | Self::LocalClosed
        )
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Reset)
    }

    fn on_syn_sent(self) -> Self {
        match self {
            Self::Init => Self::SynSent,
            s => s,
        }
    }

    fn on_ack_received(self) -> Self {
        match self {
            Self::SynSent => Self::Established,
            s => s,
        }
    }

    fn on_ack_sent(self) -> Self {
        match self {
            Self::SynReceived => Self::Established,
            s => s,
        }
    }

    fn on_fin_received(self) -> Self {
        match self {
            Self::Init | Self::SynSent | Self::SynReceived | Self::Established => {
                Self::RemoteClosed
            }
            Self::LocalClosed => Self::Closed,
            s => s,
        }
    }

    fn on_fin_sent(self) -> Self {
        match self {
            Self::Init | Self::SynSent | Self::SynReceived | Self::Established => {
                Self::LocalClosed
            }
            Self::RemoteClosed => Self::Closed,
            s => s,
        }
    }
}

struct StreamInner {
    state: StreamState,
    /// Peer opened this stream and has not seen our ACK yet.
    ack_pending: bool,
    send_window: SendWindow,
    recv_window: RecvWindow,
    buffer: VecDeque<Bytes>,
    /// Cause reported to readers and writers once reset.
    error: Option<Error>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamInner {
    fn new(state: StreamState, ack_pending: bool, window: u32) -> Self {
        Self {
            state,
            ack_pending,
            send_window: SendWindow::new(window),
            recv_window: RecvWindow::new(window),
            buffer: VecDeque::new(),
            error: None,
            read_waker: None,
            write_waker: None,
        }
    }

    /// Flags every outbound frame on this stream must carry right now.
    fn take_flags(&mut self) -> u16 {
        if self.ack_pending {
            self.ack_pending = false;
            self.state = self.state.on_ack_sent();
            flags::ACK
        } else {
            0
        }
    }

    fn reset(&mut self, cause: Error) {
        self.state = StreamState::Reset;
        self.error = Some(cause);
        self.buffer.clear();
        self.recv_window.discard();
        self.wake_reader();
        self.wake_writer();
    }

    fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }

    fn is_drained_closed(&self) -> bool {
        self.state == StreamState::Closed && self.buffer.is_empty()
    }
}

/// Stream state shared between the session's reader task and the
/// application's [`Stream`] handle.
pub(crate) struct StreamCore {
    id: StreamId,
    inner: Mutex<StreamInner>,
}

impl StreamCore {
    /// A locally opened stream and the SYN frame announcing it.
    pub(crate) fn outbound(id: StreamId, window: u32) -> (Self, Frame) {
        let mut inner = StreamInner::new(StreamState::Init, false, window);
        inner.state = inner.state.on_syn_sent();
        let core = Self {
            id,
            inner: Mutex::new(inner),
        };
        (core, Frame::window_update(id, flags::SYN, 0))
    }

    /// A stream opened by the peer.
    pub(crate) fn inbound(id: StreamId, window: u32) -> Self {
        Self {
            id,
            inner: Mutex::new(StreamInner::new(StreamState::SynReceived, true, window)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> StreamState {
        self.lock().state
    }

    /// Apply an inbound Data or WindowUpdate frame.
    ///
    /// Stream-local violations (data after FIN, window overrun, window
    /// overflow) reset this stream only. Returns `Ok(true)` when the stream
    /// should leave the session's map, and an error only when the RST
    /// answering a violation cannot be queued.
    pub(crate) fn handle_frame(&self, frame: Frame, sender: &FrameSender) -> Result<bool> {
        let header = frame.header;
        let mut inner = self.lock();

        if inner.state == StreamState::Reset {
            return Ok(true);
        }

        if header.is_rst() {
            tracing::debug!("Stream {} reset by peer", self.id);
            inner.reset(Error::StreamReset);
            return Ok(true);
        }

        if header.is_ack() {
            inner.state = inner.state.on_ack_received();
        }

        let applied = match header.frame_type {
            FrameType::Data => Self::on_data(&mut inner, frame.payload),
            FrameType::WindowUpdate => Self::on_window_update(&mut inner, header.length),
            FrameType::Ping | FrameType::GoAway => Ok(()),
        };

        if let Err(err) = applied {
            tracing::warn!("Resetting stream {}: {}", self.id, err);
            let flags = inner.take_flags() | flags::RST;
            inner.reset(Error::StreamReset);
            sender.send_reply(Frame::window_update(self.id, flags, 0))?;
            return Ok(true);
        }

        if header.is_fin() {
            inner.state = inner.state.on_fin_received();
            tracing::debug!("Stream {} received FIN, now {:?}", self.id, inner.state);
            inner.wake_reader();
        }

        Ok(inner.is_drained_closed())
    }

    fn on_data(inner: &mut StreamInner, payload: Bytes) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        if !inner.state.can_receive() {
            return Err(Error::protocol("data received after FIN"));
        }
        inner.recv_window.on_data(payload.len() as u32)?;
        inner.buffer.push_back(payload);
        inner.wake_reader();
        Ok(())
    }

    fn on_window_update(inner: &mut StreamInner, delta: u32) -> Result<()> {
        inner.send_window.grant(delta)?;
        if delta > 0 {
            inner.wake_writer();
        }
        Ok(())
    }

    /// Session teardown.
    ///
    /// With `keep_finished`, a stream whose peer already sent FIN keeps its
    /// buffered data and reads drain to end-of-stream; every other stream is
    /// reset with `cause`.
    pub(crate) fn terminate(&self, cause: Error, keep_finished: bool) {
        let mut inner = self.lock();
        match inner.state {
            StreamState::Reset => {}
            StreamState::RemoteClosed | StreamState::Closed if keep_finished => {
                inner.state = StreamState::Closed;
                inner.wake_reader();
                inner.wake_writer();
            }
            _ => inner.reset(cause),
        }
    }
}

/// A multiplexed stream.
///
/// Dropping a stream that is not fully closed resets it.
pub struct Stream {
    core: Arc<StreamCore>,
    sender: FrameSender,
    session: Weak<Shared>,
    chunk_limit: usize,
}

impl Stream {
    pub(crate) fn new(
        core: Arc<StreamCore>,
        sender: FrameSender,
        session: Weak<Shared>,
        chunk_limit: usize,
    ) -> Self {
        Self {
            core,
            sender,
            session,
            chunk_limit,
        }
    }

    /// Get the stream id.
    #[inline]
    pub fn id(&self) -> StreamId {
        self.core.id
    }

    /// Get the current state.
    pub fn state(&self) -> StreamState {
        self.core.state()
    }

    /// Bytes that may be written before the next WindowUpdate is needed.
    pub fn send_window(&self) -> u32 {
        self.core.lock().send_window.available()
    }

    /// Abort the stream: send RST, drop buffered data, fail pending and
    /// future reads and writes with [`Error::StreamReset`].
    pub fn reset(&mut self) {
        let mut inner = self.core.lock();
        if inner.state.is_terminal() {
            return;
        }
        let flags = inner.take_flags() | flags::RST;
        let _ = self.sender.send(Frame::window_update(self.core.id, flags, 0));
        inner.reset(Error::StreamReset);
        tracing::debug!("Stream {} reset locally", self.core.id);
        drop(inner);
        self.detach();
    }

    /// Send the ACK for a peer-opened stream if nothing has carried it yet.
    pub(crate) fn acknowledge(&self) {
        let mut inner = self.core.lock();
        if inner.ack_pending && !inner.state.is_terminal() {
            let flags = inner.take_flags();
            let _ = self.sender.send(Frame::window_update(self.core.id, flags, 0));
        }
    }

    fn detach(&self) {
        if let Some(session) = self.session.upgrade() {
            session.remove_stream(self.core.id);
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.core.lock();
        f.debug_struct("Stream")
            .field("id", &self.core.id)
            .field("state", &inner.state)
            .field("send_window", &inner.send_window.available())
            .field("recv_window", &inner.recv_window.remaining())
            .field("buffered", &inner.recv_window.buffered())
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut inner = this.core.lock();
        if let Some(err) = &inner.error {
            return Poll::Ready(Err(err.clone().into()));
        }

        if inner.buffer.is_empty() {
            if inner.state.can_receive() {
                inner.read_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            // End of stream.
            let closed = inner.state == StreamState::Closed;
            drop(inner);
            if closed {
                this.detach();
            }
            return Poll::Ready(Ok(()));
        }

        let mut copied = 0usize;
        while buf.remaining() > 0 {
            let Some(chunk) = inner.buffer.front_mut() else {
                break;
            };
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..n]);
            chunk.advance(n);
            if chunk.is_empty() {
                inner.buffer.pop_front();
            }
            copied += n;
        }

        if let Some(delta) = inner.recv_window.on_consume(copied as u32) {
            if inner.state.can_receive() {
                let flags = inner.take_flags();
                tracing::trace!("Stream {} returning {} bytes of window", this.core.id, delta);
                let _ = this
                    .sender
                    .send(Frame::window_update(this.core.id, flags, delta));
            }
        }

        let drained = inner.is_drained_closed();
        drop(inner);
        if drained {
            this.detach();
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut inner = this.core.lock();
        if let Some(err) = &inner.error {
            return Poll::Ready(Err(err.clone().into()));
        }
        if !inner.state.can_write() {
            return Poll::Ready(Err(Error::StreamClosed.into()));
        }

        if inner.send_window.is_exhausted() {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let granted = inner
            .send_window
            .reserve(buf.len().min(this.chunk_limit)) as usize;

        // Queued under the stream lock so frames of one stream keep their order.
        let flags = inner.take_flags();
        let frame = Frame::data(this.core.id, flags, Bytes::copy_from_slice(&buf[..granted]));
        match this.sender.send(frame) {
            Ok(()) => Poll::Ready(Ok(granted)),
            Err(err) => Poll::Ready(Err(err.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The writer task flushes after every batch.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut inner = this.core.lock();
        if let Some(err) = &inner.error {
            return Poll::Ready(Err(err.clone().into()));
        }
        if matches!(inner.state, StreamState::LocalClosed | StreamState::Closed) {
            return Poll::Ready(Ok(()));
        }

        let flags = inner.take_flags() | flags::FIN;
        if let Err(err) = this
            .sender
            .send(Frame::window_update(this.core.id, flags, 0))
        {
            return Poll::Ready(Err(err.into()));
        }
        inner.state = inner.state.on_fin_sent();
        tracing::debug!("Stream {} sent FIN, now {:?}", this.core.id, inner.state);

        let drained = inner.is_drained_closed();
        drop(inner);
        if drained {
            this.detach();
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let mut inner = self.core.lock();
        if !inner.state.is_terminal() {
            let flags = inner.take_flags() | flags::RST;
            let _ = self.sender.send(Frame::window_update(self.core.id, flags, 0));
            inner.reset(Error::StreamReset);
            tracing::debug!("Stream {} dropped while open, sent RST", self.core.id);
        }
        drop(inner);
        self.detach();
    }
}
