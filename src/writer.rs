//! Dedicated writer task: the single outbound path of a session.
//!
//! Every stream and the session itself hand frames to a [`FrameSender`];
//! one task owns the transport's write half and drains the channel, so
//! frames are never interleaved or torn on the wire.
//!
//! ```text
//! Stream 1 ─┐
//! Stream 2 ─┼─► mpsc::UnboundedSender<Outbound> ─► Writer Task ─► Transport
//! Session  ─┘
//! ```
//!
//! Frames that are already queued when the task wakes up are batched into
//! vectored writes. The channel is unbounded. Data queued per stream is
//! capped by that stream's send window. Frames the reader produces in answer
//! to the peer (ping answers, RSTs) go through [`FrameSender::send_reply`],
//! which counts them until written and refuses more than `max_pending`.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::{Frame, HEADER_SIZE};

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Message consumed by the writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Write this frame.
    Frame(Frame),
    /// Write this frame, then release its slot in the reply counter.
    Reply(Frame),
    /// Flush what is queued before this point, then shut the write half.
    Shutdown,
}

/// Handle for queueing frames to the writer task.
///
/// Cheaply cloneable; every stream holds one.
#[derive(Debug, Clone)]
pub(crate) struct FrameSender {
    tx: mpsc::UnboundedSender<Outbound>,
    /// Replies queued but not yet written.
    pending_replies: Arc<AtomicUsize>,
    max_pending: usize,
}

impl FrameSender {
    /// Queue a frame. Fails once the writer task has exited.
    pub(crate) fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(Outbound::Frame(frame))
            .map_err(|_| Error::TransportClosed)
    }

    /// Queue a frame produced in answer to the peer.
    ///
    /// Fails with a protocol violation when `max_pending` replies are still
    /// unwritten: the peer keeps asking while not reading the answers.
    pub(crate) fn send_reply(&self, frame: Frame) -> Result<()> {
        let pending = self.pending_replies.load(Ordering::Acquire);
        if pending >= self.max_pending {
            return Err(Error::protocol(format!(
                "peer is not reading: {} replies pending",
                pending
            )));
        }

        self.pending_replies.fetch_add(1, Ordering::AcqRel);
        self.tx.send(Outbound::Reply(frame)).map_err(|_| {
            self.pending_replies.fetch_sub(1, Ordering::Release);
            Error::TransportClosed
        })
    }

    #[cfg(test)]
    pub(crate) fn pending_replies(&self) -> usize {
        self.pending_replies.load(Ordering::Acquire)
    }

    /// Ask the writer to flush and close the transport's write half.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Outbound::Shutdown);
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// `max_pending` bounds the replies accepted by [`FrameSender::send_reply`].
/// The `JoinHandle` resolves when the task exits: `Ok` after a requested
/// shutdown, `Err` if the transport failed.
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    max_pending: usize,
) -> (FrameSender, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let pending_replies = Arc::new(AtomicUsize::new(0));
    let task = tokio::spawn(writer_loop(rx, writer, Arc::clone(&pending_replies)));
    let sender = FrameSender {
        tx,
        pending_replies,
        max_pending,
    };
    (sender, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut writer: W,
    pending_replies: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut chunks = VecDeque::with_capacity(MAX_BATCH_SIZE * 2);
    let mut headers = BytesMut::with_capacity(MAX_BATCH_SIZE * HEADER_SIZE);

    loop {
        let mut replies = 0;
        let mut shutdown = match rx.recv().await {
            Some(Outbound::Frame(frame)) => {
                queue_frame(&mut chunks, &mut headers, frame);
                false
            }
            Some(Outbound::Reply(frame)) => {
                queue_frame(&mut chunks, &mut headers, frame);
                replies += 1;
                false
            }
            // Every sender dropped: nobody can ask for anything else.
            Some(Outbound::Shutdown) | None => true,
        };

        let mut batched = 1;
        while !shutdown && batched < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(Outbound::Frame(frame)) => {
                    queue_frame(&mut chunks, &mut headers, frame);
                    batched += 1;
                }
                Ok(Outbound::Reply(frame)) => {
                    queue_frame(&mut chunks, &mut headers, frame);
                    replies += 1;
                    batched += 1;
                }
                Ok(Outbound::Shutdown) => shutdown = true,
                Err(_) => break,
            }
        }

        write_chunks(&mut writer, &mut chunks).await?;
        if replies > 0 {
            pending_replies.fetch_sub(replies, Ordering::Release);
        }

        if shutdown {
            tracing::trace!("Writer shutting down transport");
            writer.shutdown().await?;
            return Ok(());
        }
    }
}

/// Append a frame's header and payload to the pending chunk list.
///
/// Headers are encoded back to back into one buffer and split off, so a batch
/// shares a single allocation for all of them.
fn queue_frame(chunks: &mut VecDeque<Bytes>, headers: &mut BytesMut, frame: Frame) {
    headers.reserve(HEADER_SIZE);
    headers.extend_from_slice(&frame.header.encode());
    chunks.push_back(headers.split().freeze());
    if !frame.payload.is_empty() {
        chunks.push_back(frame.payload);
    }
}

/// Write all pending chunks with vectored writes, resuming after partial
/// writes, then flush.
async fn write_chunks<W>(writer: &mut W, chunks: &mut VecDeque<Bytes>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while !chunks.is_empty() {
        let written = {
            let slices: Vec<IoSlice<'_>> = chunks.iter().map(|c| IoSlice::new(c)).collect();
            writer.write_vectored(&slices).await?
        };

        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "transport accepted 0 bytes",
            )
            .into());
        }

        advance(chunks, written);
    }

    writer.flush().await?;
    Ok(())
}

/// Drop `n` written bytes from the front of the chunk list.
fn advance(chunks: &mut VecDeque<Bytes>, mut n: usize) {
    while n > 0 {
        let Some(front) = chunks.front_mut() else {
            break;
        };
        if front.len() <= n {
            n -= front.len();
            chunks.pop_front();
        } else {
            front.advance(n);
            n = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{flags, FrameBuffer};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_advance_across_chunk_boundaries() {
        let mut chunks: VecDeque<Bytes> = VecDeque::new();
        chunks.push_back(Bytes::from_static(b"abc"));
        chunks.push_back(Bytes::from_static(b"defg"));

        advance(&mut chunks, 2);
        assert_eq!(chunks[0], Bytes::from_static(b"c"));

        advance(&mut chunks, 3);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], Bytes::from_static(b"fg"));

        advance(&mut chunks, 2);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_queue_frame_skips_empty_payload() {
        let mut chunks = VecDeque::new();
        let mut headers = BytesMut::new();

        queue_frame(&mut chunks, &mut headers, Frame::window_update(1, flags::SYN, 0));
        queue_frame(
            &mut chunks,
            &mut headers,
            Frame::data(1, 0, Bytes::from_static(b"xyz")),
        );

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), HEADER_SIZE);
        assert_eq!(chunks[1].len(), HEADER_SIZE);
        assert_eq!(chunks[2], Bytes::from_static(b"xyz"));
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (client, mut server) = duplex(64 * 1024);
        let (sender, _task) = spawn_writer_task(client, 16);

        for i in 1..=10u32 {
            let payload = Bytes::copy_from_slice(&i.to_be_bytes());
            sender.send(Frame::data(i * 2 - 1, 0, payload)).unwrap();
        }
        sender.shutdown();

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();

        let frames = FrameBuffer::new().push(&raw).unwrap();
        assert_eq!(frames.len(), 10);
        for (i, frame) in frames.iter().enumerate() {
            let n = i as u32 + 1;
            assert_eq!(frame.stream_id(), n * 2 - 1);
            assert_eq!(frame.payload(), &n.to_be_bytes());
        }
    }

    #[tokio::test]
    async fn test_shutdown_flushes_then_closes() {
        let (client, mut server) = duplex(1024);
        let (sender, task) = spawn_writer_task(client, 16);

        sender.send(Frame::go_away(0)).unwrap();
        sender.shutdown();

        assert!(task.await.unwrap().is_ok());

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw.len(), HEADER_SIZE);

        // Writer is gone; queueing fails.
        assert!(matches!(
            sender.send(Frame::ping(flags::SYN, 1)),
            Err(Error::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn test_writer_exits_when_all_senders_drop() {
        let (client, _server) = duplex(1024);
        let (sender, task) = spawn_writer_task(client, 16);

        drop(sender);

        assert!(task.await.unwrap().is_ok());
    }

    /// Transport that accepts nothing, like a peer that stopped reading.
    struct Stalled;

    impl AsyncWrite for Stalled {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_reply_limit_with_stalled_transport() {
        let (sender, _task) = spawn_writer_task(Stalled, 3);

        for id in 1..=3 {
            sender.send_reply(Frame::ping(flags::ACK, id)).unwrap();
        }
        assert_eq!(sender.pending_replies(), 3);

        assert!(matches!(
            sender.send_reply(Frame::ping(flags::ACK, 4)),
            Err(Error::ProtocolViolation(_))
        ));
        // Ordinary frames are not counted.
        sender.send(Frame::go_away(0)).unwrap();
        assert_eq!(sender.pending_replies(), 3);
    }

    #[tokio::test]
    async fn test_written_replies_release_their_slots() {
        let (client, mut server) = duplex(1024);
        let (sender, task) = spawn_writer_task(client, 2);

        for round in 0..5u32 {
            sender.send_reply(Frame::ping(flags::ACK, round * 2)).unwrap();
            sender.send_reply(Frame::ping(flags::ACK, round * 2 + 1)).unwrap();

            let mut raw = [0u8; HEADER_SIZE * 2];
            server.read_exact(&mut raw).await.unwrap();
            // The writer releases slots right after its flush completes.
            while sender.pending_replies() > 0 {
                tokio::task::yield_now().await;
            }
        }

        sender.shutdown();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_write_error_is_reported() {
        let (client, server) = duplex(16);
        drop(server);
        let (sender, task) = spawn_writer_task(client, 16);

        sender.send(Frame::ping(flags::SYN, 1)).unwrap();

        assert!(matches!(task.await.unwrap(), Err(Error::Io(_))));
    }
}
