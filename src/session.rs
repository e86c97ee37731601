//! Session: one transport, many streams.
//!
//! A [`Session`] owns three background tasks:
//! 1. Reader: parses frames from the transport and dispatches them to
//!    streams, answers pings, records GoAway, and enforces stream id rules
//! 2. Writer: drains the frame queue onto the transport (see `writer`)
//! 3. Keepalive (optional): pings on an interval and kills the session when
//!    an answer does not arrive in time
//!
//! Any fatal condition (I/O failure, malformed frame, version mismatch,
//! unexpected close) terminates the session exactly once: every stream is
//! reset with the cause, pending pings fail, and the transport is shut.
//!
//! # Example
//!
//! ```ignore
//! use muxwire::{Config, Session};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! let tcp = tokio::net::TcpStream::connect("127.0.0.1:7000").await?;
//! let session = Session::client(tcp, Config::default());
//!
//! let mut stream = session.open_stream()?;
//! stream.write_all(b"hello").await?;
//! stream.shutdown().await?;
//!
//! let rtt = session.ping().await?;
//! session.close()?;
//! session.wait_for_shutdown().await?;
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{flags, go_away, Frame, FrameBuffer, FrameType, Header};
use crate::stream::{Stream, StreamCore, StreamId};
use crate::writer::{spawn_writer_task, FrameSender};

/// Which side of the connection this session is.
///
/// Determines stream id parity: clients open odd ids, servers even ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Opens odd-numbered streams.
    Client,
    /// Opens even-numbered streams.
    Server,
}

impl Mode {
    fn first_stream_id(self) -> u32 {
        match self {
            Mode::Client => 1,
            Mode::Server => 2,
        }
    }

    /// Check whether `id` has the parity of streams this side opens.
    pub fn is_local_id(self, id: StreamId) -> bool {
        match self {
            Mode::Client => id % 2 == 1,
            Mode::Server => id % 2 == 0,
        }
    }
}

struct SessionState {
    streams: HashMap<StreamId, Arc<StreamCore>>,
    /// Next id to open locally. Wider than a stream id so exhaustion shows.
    next_stream_id: u64,
    /// Highest id the peer has opened (or tried to).
    last_remote_id: u32,
    pings: HashMap<u32, oneshot::Sender<()>>,
    next_ping_id: u32,
    /// We sent GoAway.
    local_go_away: bool,
    /// Peer sent GoAway with this code.
    remote_go_away: Option<u32>,
    /// Set once, when the session terminates.
    error: Option<Error>,
}

impl SessionState {
    fn new(mode: Mode) -> Self {
        Self {
            streams: HashMap::new(),
            next_stream_id: u64::from(mode.first_stream_id()),
            last_remote_id: 0,
            pings: HashMap::new(),
            next_ping_id: 0,
            local_go_away: false,
            remote_go_away: None,
            error: None,
        }
    }
}

/// State shared between the [`Session`] handle, its tasks and its streams.
pub(crate) struct Shared {
    config: Config,
    mode: Mode,
    sender: FrameSender,
    state: Mutex<SessionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.lock().error.is_some()
    }

    /// Why the session can no longer be used.
    fn closed_error(&self) -> Error {
        self.lock().error.clone().unwrap_or(Error::SessionShutdown)
    }

    fn open_stream(self: &Arc<Self>) -> Result<Stream> {
        let mut state = self.lock();
        if let Some(err) = &state.error {
            return Err(err.clone());
        }
        if state.local_go_away {
            return Err(Error::SessionShutdown);
        }
        if let Some(code) = state.remote_go_away {
            return Err(Error::RemoteGoAway(code));
        }
        if state.next_stream_id > u64::from(u32::MAX) {
            return Err(Error::StreamsExhausted);
        }

        let id = state.next_stream_id as u32;
        let (core, syn) = StreamCore::outbound(id, self.config.initial_stream_window);
        // Queued under the session lock so SYNs reach the wire in id order.
        self.sender.send(syn)?;
        state.next_stream_id += 2;

        let core = Arc::new(core);
        state.streams.insert(id, core.clone());
        drop(state);

        tracing::debug!("Opened stream {}", id);
        Ok(self.stream_handle(core))
    }

    fn stream_handle(self: &Arc<Self>, core: Arc<StreamCore>) -> Stream {
        Stream::new(
            core,
            self.sender.clone(),
            Arc::downgrade(self),
            self.config.frame_chunk_limit(),
        )
    }

    /// Forget a stream that is closed, reset or dropped.
    pub(crate) fn remove_stream(&self, id: StreamId) {
        let drained = {
            let mut state = self.lock();
            if state.streams.remove(&id).is_none() {
                return;
            }
            tracing::trace!("Removed stream {}, {} left", id, state.streams.len());
            state.local_go_away && state.streams.is_empty() && state.error.is_none()
        };

        if drained {
            tracing::debug!("All streams drained after GoAway, closing transport");
            self.terminate(Error::SessionShutdown, true);
        }
    }

    /// Tear the session down. Only the first call has any effect.
    ///
    /// With `keep_finished`, streams the peer already finished keep their
    /// buffered data for the reader; all others are reset with `cause`.
    fn terminate(&self, cause: Error, keep_finished: bool) {
        let (streams, pings) = {
            let mut state = self.lock();
            if state.error.is_some() {
                return;
            }
            state.error = Some(cause.clone());
            let streams: Vec<_> = state.streams.drain().map(|(_, core)| core).collect();
            let pings = std::mem::take(&mut state.pings);
            (streams, pings)
        };

        tracing::debug!(
            "Session terminated ({}), resetting {} streams",
            cause,
            streams.len()
        );

        for core in streams {
            core.terminate(cause.clone(), keep_finished);
        }
        // Waiting pingers see their sender dropped.
        drop(pings);

        self.sender.shutdown();
        self.shutdown_tx.send_replace(true);
    }

    async fn ping(&self) -> Result<Duration> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.lock();
            if let Some(err) = &state.error {
                return Err(err.clone());
            }
            let id = state.next_ping_id;
            state.next_ping_id = id.wrapping_add(1);
            state.pings.insert(id, tx);
            id
        };

        let started = Instant::now();
        if let Err(err) = self.sender.send(Frame::ping(flags::SYN, id)) {
            self.lock().pings.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.config.ping_timeout, rx).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.lock().pings.remove(&id);
                tracing::debug!("Ping {} timed out", id);
                Err(Error::Timeout)
            }
        }
    }

    fn close(&self) -> Result<()> {
        let idle = {
            let mut state = self.lock();
            if state.error.is_some() || state.local_go_away {
                return Ok(());
            }
            state.local_go_away = true;
            state.streams.is_empty()
        };

        tracing::debug!("Sending GoAway");
        self.sender.send(Frame::go_away(go_away::NORMAL))?;

        if idle {
            self.terminate(Error::SessionShutdown, true);
        }
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, frame: Frame, accept_tx: &mpsc::Sender<Stream>) -> Result<()> {
        match frame.header.frame_type {
            FrameType::Ping => self.on_ping(&frame.header),
            FrameType::GoAway => {
                self.on_go_away(frame.header.length);
                Ok(())
            }
            FrameType::Data | FrameType::WindowUpdate => self.on_stream_frame(frame, accept_tx),
        }
    }

    fn on_ping(&self, header: &Header) -> Result<()> {
        if header.is_syn() {
            return self.sender.send_reply(Frame::ping(flags::ACK, header.length));
        }
        if header.is_ack() {
            match self.lock().pings.remove(&header.length) {
                Some(waiter) => {
                    let _ = waiter.send(());
                }
                None => tracing::trace!("Ignoring unsolicited ping answer {}", header.length),
            }
        }
        Ok(())
    }

    fn on_go_away(&self, code: u32) {
        self.lock().remote_go_away = Some(code);
        match code {
            go_away::NORMAL => tracing::debug!("Peer is going away"),
            code => tracing::warn!("Peer is going away with error code {}", code),
        }
    }

    fn on_stream_frame(
        self: &Arc<Self>,
        frame: Frame,
        accept_tx: &mpsc::Sender<Stream>,
    ) -> Result<()> {
        let id = frame.stream_id();
        let existing = self.lock().streams.get(&id).cloned();

        if let Some(core) = existing {
            if frame.header.is_syn() {
                return Err(Error::protocol(format!("SYN for open stream {}", id)));
            }
            if core.handle_frame(frame, &self.sender)? {
                self.remove_stream(id);
            }
            return Ok(());
        }

        if frame.header.is_syn() {
            return self.on_syn(frame, accept_tx);
        }

        if self.is_retired(id) {
            tracing::trace!(
                "Discarding {:?} frame for closed stream {}",
                frame.header.frame_type,
                id
            );
            return Ok(());
        }

        Err(Error::protocol(format!("frame for unknown stream {}", id)))
    }

    /// Whether `id` belongs to a stream that existed and is gone.
    ///
    /// Only the highest remote id is tracked, so remote ids the peer skipped
    /// count as gone too.
    fn is_retired(&self, id: StreamId) -> bool {
        let state = self.lock();
        if self.mode.is_local_id(id) {
            u64::from(id) < state.next_stream_id
        } else {
            id <= state.last_remote_id
        }
    }

    fn on_syn(self: &Arc<Self>, frame: Frame, accept_tx: &mpsc::Sender<Stream>) -> Result<()> {
        let id = frame.stream_id();
        if self.mode.is_local_id(id) {
            return Err(Error::protocol(format!(
                "peer opened stream {} with our id parity",
                id
            )));
        }

        let refuse = {
            let mut state = self.lock();
            if id <= state.last_remote_id {
                return Err(Error::protocol(format!(
                    "stream id {} not above last opened {}",
                    id, state.last_remote_id
                )));
            }
            state.last_remote_id = id;
            state.local_go_away
        };

        // The reader is the only producer, so capacity seen here cannot
        // shrink before the `try_send` below.
        if refuse || accept_tx.capacity() == 0 {
            if refuse {
                tracing::debug!("Refusing stream {} after GoAway", id);
            } else {
                tracing::warn!("Accept backlog full, refusing stream {}", id);
            }
            return self
                .sender
                .send_reply(Frame::window_update(id, flags::ACK | flags::RST, 0));
        }

        let core = Arc::new(StreamCore::inbound(id, self.config.initial_stream_window));
        // The SYN may carry data, credit or FIN of its own.
        if core.handle_frame(frame, &self.sender)? {
            return Ok(());
        }

        self.lock().streams.insert(id, core.clone());
        tracing::debug!("Peer opened stream {}", id);

        if let Err(err) = accept_tx.try_send(self.stream_handle(core)) {
            // Only when the session is gone; dropping the stream resets it.
            drop(err.into_inner());
        }
        Ok(())
    }
}

/// A multiplexed session over a single transport.
///
/// Dropping the session aborts it.
pub struct Session {
    shared: Arc<Shared>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
}

impl Session {
    /// Start a session over `io` and spawn its tasks on the current runtime.
    pub fn new<T>(io: T, config: Config, mode: Mode) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // 1. Split transport
        let (read_half, write_half) = tokio::io::split(io);

        // 2. Spawn writer task
        let (sender, writer_task) = spawn_writer_task(write_half, config.max_pending_replies);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let keepalive = config.keepalive_interval;

        let shared = Arc::new(Shared {
            config,
            mode,
            sender,
            state: Mutex::new(SessionState::new(mode)),
            shutdown_tx,
        });

        // 3. A failed write kills the session
        let weak = Arc::downgrade(&shared);
        tokio::spawn(async move {
            let result = match writer_task.await {
                Ok(result) => result,
                Err(e) => Err(io::Error::new(io::ErrorKind::Other, e).into()),
            };
            if let Err(e) = result {
                if let Some(shared) = weak.upgrade() {
                    tracing::error!("Transport write failed: {}", e);
                    shared.terminate(e, false);
                }
            }
        });

        // 4. Spawn read loop
        tokio::spawn(read_task(read_half, shared.clone(), accept_tx, shutdown_rx));

        // 5. Keepalive
        if let Some(interval) = keepalive {
            tokio::spawn(keepalive_task(
                Arc::downgrade(&shared),
                interval,
                shared.shutdown_tx.subscribe(),
            ));
        }

        tracing::debug!("Session started as {:?}", mode);
        Session {
            shared,
            incoming: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Start a client-side session (odd stream ids).
    pub fn client<T>(io: T, config: Config) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(io, config, Mode::Client)
    }

    /// Start a server-side session (even stream ids).
    pub fn server<T>(io: T, config: Config) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(io, config, Mode::Server)
    }

    /// Open a new outbound stream.
    ///
    /// The SYN is sent immediately; data may be written before the peer
    /// acknowledges. Fails after `close()`, after the peer's GoAway, once
    /// the session has terminated, or when stream ids run out.
    pub fn open_stream(&self) -> Result<Stream> {
        self.shared.open_stream()
    }

    /// Wait for the next stream opened by the peer.
    ///
    /// Fails once the session has terminated.
    pub async fn accept_stream(&self) -> Result<Stream> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(stream) if !self.shared.is_closed() => {
                stream.acknowledge();
                Ok(stream)
            }
            _ => Err(self.shared.closed_error()),
        }
    }

    /// Measure the round trip time to the peer.
    ///
    /// Fails with [`Error::Timeout`] if no answer arrives within
    /// `ping_timeout`; the session stays open.
    pub async fn ping(&self) -> Result<Duration> {
        self.shared.ping().await
    }

    /// Close gracefully.
    ///
    /// Sends GoAway, refuses new streams in both directions, and shuts the
    /// transport once every open stream has finished.
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Close immediately, resetting every open stream.
    pub fn abort(&self) {
        self.shared.terminate(Error::SessionShutdown, false);
    }

    /// Number of streams currently tracked.
    pub fn num_streams(&self) -> usize {
        self.shared.lock().streams.len()
    }

    /// Check whether the session has terminated.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Get the session mode.
    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    /// Get the session configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Wait until the session has terminated.
    ///
    /// Resolves `Ok` after a local shutdown, or when the peer sent a normal
    /// GoAway before closing the transport. An EOF without GoAway resolves
    /// with [`Error::TransportClosed`]; any other fatal error is returned
    /// as is.
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        let mut rx = self.shared.shutdown_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
        let state = self.shared.lock();
        match state.error.clone().unwrap_or(Error::SessionShutdown) {
            Error::SessionShutdown => Ok(()),
            Error::TransportClosed if state.remote_go_away == Some(go_away::NORMAL) => Ok(()),
            err => Err(err),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.terminate(Error::SessionShutdown, false);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mode", &self.shared.mode)
            .field("streams", &self.num_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_task<R>(
    reader: R,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<Stream>,
    shutdown_rx: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let Err(err) = read_loop(reader, &shared, &accept_tx, shutdown_rx).await else {
        return;
    };

    match &err {
        Error::ProtocolViolation(_) | Error::VersionMismatch { .. } => {
            tracing::error!("Protocol error, terminating session: {}", err);
            let _ = shared.sender.send(Frame::go_away(go_away::PROTOCOL_ERROR));
        }
        Error::TransportClosed => tracing::debug!("Transport closed by peer"),
        _ => tracing::error!("Transport read failed: {}", err),
    }

    let keep_finished = matches!(err, Error::TransportClosed);
    shared.terminate(err, keep_finished);
}

/// Read frames until the transport ends, a fatal error occurs, or the
/// session is shut down locally.
async fn read_loop<R>(
    mut reader: R,
    shared: &Arc<Shared>,
    accept_tx: &mpsc::Sender<Stream>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frame_buffer = FrameBuffer::with_max_frame_size(shared.config.max_frame_size);
    let mut buf = vec![0u8; shared.config.read_buffer_size.max(1)];

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => read?,
            _ = shutdown_rx.wait_for(|closed| *closed) => return Ok(()),
        };
        if n == 0 {
            if !frame_buffer.is_empty() {
                tracing::debug!(
                    "Transport closed inside a frame, dropping {} bytes",
                    frame_buffer.len()
                );
            }
            return Err(Error::TransportClosed);
        }

        for frame in frame_buffer.push(&buf[..n])? {
            shared.dispatch(frame, accept_tx)?;
        }
    }
}

async fn keepalive_task(
    shared: Weak<Shared>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.wait_for(|closed| *closed) => return,
        }

        let Some(shared) = shared.upgrade() else {
            return;
        };
        match shared.ping().await {
            Ok(rtt) => tracing::trace!("Keepalive ping answered in {:?}", rtt),
            Err(Error::Timeout) => {
                tracing::warn!("Keepalive ping timed out, terminating session");
                shared.terminate(Error::Timeout, false);
                return;
            }
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, FrameBuffer, HEADER_SIZE};
    use crate::stream::StreamState;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream, ReadBuf};
    use tokio::time::timeout;

    /// Transport that never delivers data and fails every write.
    struct BrokenWrite;

    impl AsyncRead for BrokenWrite {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenWrite {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Session on one end, raw bytes on the other.
    fn raw_peer(mode: Mode, config: Config) -> (Session, DuplexStream) {
        let (ours, theirs) = duplex(64 * 1024);
        (Session::new(ours, config, mode), theirs)
    }

    async fn read_frames(peer: &mut DuplexStream, count: usize) -> Vec<Frame> {
        let mut parser = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut raw = vec![0u8; 64 * 1024];
        while frames.len() < count {
            let n = peer.read(&mut raw).await.unwrap();
            assert!(n > 0, "session closed the transport early");
            frames.extend(parser.push(&raw[..n]).unwrap());
        }
        frames
    }

    #[test]
    fn test_mode_parity() {
        assert!(Mode::Client.is_local_id(1));
        assert!(!Mode::Client.is_local_id(2));
        assert!(Mode::Server.is_local_id(2));
        assert!(!Mode::Server.is_local_id(3));
    }

    #[tokio::test]
    async fn test_client_opens_odd_ids_with_syn() {
        let (session, mut peer) = raw_peer(Mode::Client, Config::default());

        let a = session.open_stream().unwrap();
        let b = session.open_stream().unwrap();
        assert_eq!((a.id(), b.id()), (1, 3));
        assert_eq!(a.state(), StreamState::SynSent);

        let frames = read_frames(&mut peer, 2).await;
        for frame in &frames {
            assert_eq!(frame.header.frame_type, FrameType::WindowUpdate);
            assert!(frame.header.is_syn());
            assert_eq!(frame.header.length, 0);
        }
        assert_eq!(frames[0].stream_id(), 1);
        assert_eq!(frames[1].stream_id(), 3);
    }

    #[tokio::test]
    async fn test_server_opens_even_ids() {
        let (session, _peer) = raw_peer(Mode::Server, Config::default());
        assert_eq!(session.open_stream().unwrap().id(), 2);
        assert_eq!(session.open_stream().unwrap().id(), 4);
    }

    #[tokio::test]
    async fn test_inbound_ping_is_echoed() {
        let (_session, mut peer) = raw_peer(Mode::Server, Config::default());

        peer.write_all(&build_frame(&Frame::ping(flags::SYN, 0xfeed)))
            .await
            .unwrap();

        let frames = read_frames(&mut peer, 1).await;
        assert_eq!(frames[0].header.frame_type, FrameType::Ping);
        assert!(frames[0].header.is_ack());
        assert_eq!(frames[0].header.length, 0xfeed);
    }

    #[tokio::test]
    async fn test_ping_measures_round_trip() {
        let (session, mut peer) = raw_peer(Mode::Client, Config::default());

        let echo = tokio::spawn(async move {
            let frames = read_frames(&mut peer, 1).await;
            let value = frames[0].header.length;
            peer.write_all(&build_frame(&Frame::ping(flags::ACK, value)))
                .await
                .unwrap();
            peer
        });

        let rtt = session.ping().await.unwrap();
        assert!(rtt < Duration::from_secs(5));
        let _peer = echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_timeout_keeps_session_open() {
        let config = Config::default().with_ping_timeout(Duration::from_millis(50));
        let (session, _peer) = raw_peer(Mode::Client, config);

        assert!(matches!(session.ping().await, Err(Error::Timeout)));
        assert!(!session.is_closed());
        assert!(session.shared.lock().pings.is_empty());
    }

    #[tokio::test]
    async fn test_syn_with_local_parity_is_fatal() {
        let (session, mut peer) = raw_peer(Mode::Client, Config::default());

        peer.write_all(&build_frame(&Frame::window_update(1, flags::SYN, 0)))
            .await
            .unwrap();

        assert!(matches!(
            session.wait_for_shutdown().await,
            Err(Error::ProtocolViolation(_))
        ));
        // GoAway(protocol error) precedes the close.
        let frames = read_frames(&mut peer, 1).await;
        assert_eq!(frames[0].header.frame_type, FrameType::GoAway);
        assert_eq!(frames[0].header.length, go_away::PROTOCOL_ERROR);
    }

    #[tokio::test]
    async fn test_reused_inbound_id_is_fatal() {
        let (session, mut peer) = raw_peer(Mode::Server, Config::default());

        let mut bytes = build_frame(&Frame::window_update(5, flags::SYN, 0));
        bytes.extend(build_frame(&Frame::window_update(3, flags::SYN, 0)));
        peer.write_all(&bytes).await.unwrap();

        assert!(matches!(
            session.wait_for_shutdown().await,
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_frame_for_never_opened_stream_is_fatal() {
        let (session, mut peer) = raw_peer(Mode::Server, Config::default());

        peer.write_all(&build_frame(&Frame::window_update(9, 0, 10)))
            .await
            .unwrap();

        assert!(matches!(
            session.wait_for_shutdown().await,
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_late_frames_for_closed_stream_are_discarded() {
        let (session, mut peer) = raw_peer(Mode::Client, Config::default());

        let mut stream = session.open_stream().unwrap();
        stream.reset();
        assert_eq!(session.num_streams(), 0);
        let frames = read_frames(&mut peer, 2).await;
        assert!(frames[1].header.is_rst());

        // Stream 1 is gone; its late data must not kill the session.
        let late = Frame::data(1, 0, bytes::Bytes::from_static(b"late"));
        let mut wire = build_frame(&late);
        wire.extend(build_frame(&Frame::ping(flags::SYN, 7)));
        peer.write_all(&wire).await.unwrap();

        let frames = read_frames(&mut peer, 1).await;
        assert_eq!(frames[0].header.frame_type, FrameType::Ping);
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn test_skipped_remote_ids_count_as_retired() {
        let (session, mut peer) = raw_peer(Mode::Server, Config::default());

        // Opening 5 retires the skipped ids 1 and 3 as well.
        let mut wire = build_frame(&Frame::window_update(5, flags::SYN, 0));
        wire.extend(build_frame(&Frame::data(3, 0, bytes::Bytes::from_static(b"x"))));
        wire.extend(build_frame(&Frame::ping(flags::SYN, 1)));
        peer.write_all(&wire).await.unwrap();

        let frames = read_frames(&mut peer, 1).await;
        assert_eq!(frames[0].header.frame_type, FrameType::Ping);
        assert!(!session.is_closed());

        // Above the highest opened id nothing is retired.
        peer.write_all(&build_frame(&Frame::window_update(7, 0, 10)))
            .await
            .unwrap();
        assert!(matches!(
            session.wait_for_shutdown().await,
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_backlog_overflow_refuses_with_rst() {
        let config = Config::default().with_accept_backlog(1);
        let (session, mut peer) = raw_peer(Mode::Server, config);

        let mut bytes = build_frame(&Frame::window_update(1, flags::SYN, 0));
        bytes.extend(build_frame(&Frame::window_update(3, flags::SYN, 0)));
        peer.write_all(&bytes).await.unwrap();

        let frames = read_frames(&mut peer, 1).await;
        assert_eq!(frames[0].stream_id(), 3);
        assert!(frames[0].header.is_rst());

        let accepted = session.accept_stream().await.unwrap();
        assert_eq!(accepted.id(), 1);
        assert_eq!(accepted.state(), StreamState::Established);
    }

    #[tokio::test]
    async fn test_remote_go_away_blocks_open() {
        let (session, mut peer) = raw_peer(Mode::Client, Config::default());

        peer.write_all(&build_frame(&Frame::go_away(go_away::NORMAL)))
            .await
            .unwrap();
        // Ping round trip guarantees the GoAway was processed.
        let echo = tokio::spawn(async move {
            let frames = read_frames(&mut peer, 1).await;
            let value = frames[0].header.length;
            peer.write_all(&build_frame(&Frame::ping(flags::ACK, value)))
                .await
                .unwrap();
            peer
        });
        session.ping().await.unwrap();
        let _peer = echo.await.unwrap();

        assert!(matches!(
            session.open_stream(),
            Err(Error::RemoteGoAway(go_away::NORMAL))
        ));
    }

    #[tokio::test]
    async fn test_close_without_streams_sends_go_away_and_shuts() {
        let (session, mut peer) = raw_peer(Mode::Client, Config::default());

        session.close().unwrap();
        session.wait_for_shutdown().await.unwrap();

        let mut raw = Vec::new();
        peer.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw.len(), HEADER_SIZE);
        let header = Header::decode(&raw).unwrap().unwrap();
        assert_eq!(header.frame_type, FrameType::GoAway);
        assert_eq!(header.length, go_away::NORMAL);

        assert!(matches!(
            session.open_stream(),
            Err(Error::SessionShutdown)
        ));
    }

    #[tokio::test]
    async fn test_abort_resets_streams() {
        let (session, _peer) = raw_peer(Mode::Client, Config::default());
        let mut stream = session.open_stream().unwrap();

        session.abort();

        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf).await.unwrap_err();
        assert!(matches!(
            Error::from_io_error(err),
            Error::SessionShutdown
        ));
        assert!(session.is_closed());
        assert!(matches!(
            session.accept_stream().await,
            Err(Error::SessionShutdown)
        ));
    }

    #[tokio::test]
    async fn test_peer_flooding_pings_without_reading_fails_session() {
        let config = Config::default().with_max_pending_replies(8);
        let (ours, mut theirs) = duplex(1024);
        let session = Session::new(ours, config, Mode::Server);

        let mut flood = Vec::new();
        for value in 0..2_000u32 {
            flood.extend_from_slice(&build_frame(&Frame::ping(flags::SYN, value)));
        }
        // Writes every ping and never reads an answer.
        tokio::spawn(async move {
            let _ = theirs.write_all(&flood).await;
            theirs
        });

        let result = timeout(Duration::from_secs(5), session.wait_for_shutdown())
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_write_failure_resets_streams_with_io_error() {
        let session = Session::client(BrokenWrite, Config::default());
        // Queueing the SYN makes the writer hit the broken transport.
        let mut stream = session.open_stream().unwrap();

        let mut buf = [0u8; 4];
        let err = timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(Error::from_io_error(err), Error::Io(_)));

        assert!(matches!(
            session.wait_for_shutdown().await,
            Err(Error::Io(_))
        ));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_eof_without_go_away_is_reported() {
        let (session, peer) = raw_peer(Mode::Client, Config::default());

        drop(peer);

        assert!(matches!(
            session.wait_for_shutdown().await,
            Err(Error::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_eof_after_go_away_is_clean() {
        let (session, mut peer) = raw_peer(Mode::Client, Config::default());

        peer.write_all(&build_frame(&Frame::go_away(go_away::NORMAL)))
            .await
            .unwrap();
        peer.shutdown().await.unwrap();

        session.wait_for_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_timeout_terminates_session() {
        let config = Config::default()
            .with_keepalive(Duration::from_millis(20))
            .with_ping_timeout(Duration::from_millis(50));
        let (session, _peer) = raw_peer(Mode::Client, config);

        assert!(matches!(
            session.wait_for_shutdown().await,
            Err(Error::Timeout)
        ));
    }
}
