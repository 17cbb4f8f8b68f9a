//! One logical, ordered, bidirectional byte-connection inside a session.
//!
//! A [`Stream`] is a cheap cloneable handle. Inbound payload chunks are
//! queued by the session's dispatch loop and consumed either whole
//! ([`Stream::read_message`]) or as a byte stream ([`Stream::read`]).
//! Outbound chunks go through the session's serialized writer, one message
//! per [`Stream::write_message`] call.
//!
//! # Lifecycle
//!
//! ```text
//! Pending ──ConnAck──► Established ──close / ConnClosed / teardown──► Closed
//!    └──────────UnknownProto / NoSuchConnection / teardown──────────────┘
//! ```
//!
//! Once closed, reads drain whatever is still queued and then return
//! [`MuxError::EndOfStream`]; writes fail immediately.
//!
//! [`Stream::into_io`] wraps a stream for code written against tokio's
//! `AsyncRead`/`AsyncWrite`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{MuxError, Result};
use crate::protocol::Message;
use crate::session::{lock, SessionInner};

mod io;

pub use io::StreamIo;

/// Default number of inbound chunks buffered per stream.
pub const DEFAULT_STREAM_QUEUE_CAPACITY: usize = 64;

/// Observable state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Requested locally, waiting for the peer's answer.
    Pending,
    /// Acknowledged by both sides; payload may flow.
    Established,
    /// Terminal.
    Closed,
}

/// Outcome of the establishment handshake, delivered to `open_stream`.
pub(crate) type Establishment = oneshot::Receiver<Result<()>>;

/// Handle to a multiplexed stream.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<StreamShared>,
}

struct StreamShared {
    connection_id: String,
    other_client: String,
    protocol: String,
    established: AtomicBool,
    closed: AtomicBool,
    closed_signal: watch::Sender<bool>,
    tx: mpsc::Sender<Bytes>,
    reader: tokio::sync::Mutex<StreamReader>,
    establish: Mutex<Option<oneshot::Sender<Result<()>>>>,
    session: Weak<SessionInner>,
}

/// Read side: the queue plus the unread remainder of a partially read chunk.
struct StreamReader {
    rx: mpsc::Receiver<Bytes>,
    current: Option<Bytes>,
}

impl Stream {
    fn build(
        connection_id: &str,
        other_client: &str,
        protocol: &str,
        queue_capacity: usize,
        session: Weak<SessionInner>,
        established: bool,
        establish: Option<oneshot::Sender<Result<()>>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (closed_signal, _) = watch::channel(false);
        Self {
            shared: Arc::new(StreamShared {
                connection_id: connection_id.to_string(),
                other_client: other_client.to_string(),
                protocol: protocol.to_string(),
                established: AtomicBool::new(established),
                closed: AtomicBool::new(false),
                closed_signal,
                tx,
                reader: tokio::sync::Mutex::new(StreamReader { rx, current: None }),
                establish: Mutex::new(establish),
                session,
            }),
        }
    }

    /// A locally requested stream waiting for `ConnAck`.
    pub(crate) fn pending(
        connection_id: &str,
        other_client: &str,
        protocol: &str,
        queue_capacity: usize,
        session: Weak<SessionInner>,
    ) -> (Self, Establishment) {
        let (tx, rx) = oneshot::channel();
        let stream = Self::build(
            connection_id,
            other_client,
            protocol,
            queue_capacity,
            session,
            false,
            Some(tx),
        );
        (stream, rx)
    }

    /// A stream accepted from a peer's request.
    pub(crate) fn established(
        connection_id: &str,
        other_client: &str,
        protocol: &str,
        queue_capacity: usize,
        session: Weak<SessionInner>,
    ) -> Self {
        Self::build(
            connection_id,
            other_client,
            protocol,
            queue_capacity,
            session,
            true,
            None,
        )
    }

    /// Identifier of this stream within its session.
    #[inline]
    pub fn connection_id(&self) -> &str {
        &self.shared.connection_id
    }

    /// Name of the remote peer.
    #[inline]
    pub fn other_client(&self) -> &str {
        &self.shared.other_client
    }

    /// Protocol negotiated when the stream was opened.
    #[inline]
    pub fn protocol(&self) -> &str {
        &self.shared.protocol
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        if self.is_closed() {
            StreamState::Closed
        } else if self.shared.established.load(Ordering::Acquire) {
            StreamState::Established
        } else {
            StreamState::Pending
        }
    }

    /// True once the stream reached `Established` and is not closed.
    #[inline]
    pub fn is_established(&self) -> bool {
        self.state() == StreamState::Established
    }

    /// True once the stream is closed, locally or remotely.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Read one whole payload chunk, waiting if none is queued.
    ///
    /// If an earlier [`read`](Self::read) left part of a chunk unread, that
    /// remainder is returned.
    ///
    /// # Errors
    ///
    /// [`MuxError::EndOfStream`] once the stream is closed and drained.
    pub async fn read_message(&self) -> Result<Bytes> {
        let mut reader = self.shared.reader.lock().await;
        if let Some(current) = reader.current.take() {
            return Ok(current);
        }
        self.next_chunk(&mut reader).await
    }

    /// Byte-stream style read into `buf`.
    ///
    /// Waits only for the first chunk; any further chunks already queued are
    /// copied as long as `buf` has room. A chunk that does not fit is kept
    /// for the next read. An empty `buf` returns `Ok(0)` immediately.
    ///
    /// # Errors
    ///
    /// [`MuxError::EndOfStream`] once the stream is closed and drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut reader = self.shared.reader.lock().await;
        let mut n = 0;

        while n < buf.len() {
            let chunk = match reader.current.take() {
                Some(chunk) => chunk,
                None if n == 0 => self.next_chunk(&mut reader).await?,
                None => match reader.rx.try_recv() {
                    Ok(chunk) => chunk,
                    Err(_) => break,
                },
            };

            let take = chunk.len().min(buf.len() - n);
            buf[n..n + take].copy_from_slice(&chunk[..take]);
            n += take;

            if take < chunk.len() {
                reader.current = Some(chunk.slice(take..));
            }
        }

        Ok(n)
    }

    /// Wait for the next queued chunk, or end-of-stream once closed.
    async fn next_chunk(&self, reader: &mut StreamReader) -> Result<Bytes> {
        let mut closed = self.shared.closed_signal.subscribe();
        tokio::select! {
            biased;
            chunk = reader.rx.recv() => chunk.ok_or(MuxError::EndOfStream),
            _ = closed.wait_for(|closed| *closed) => Err(MuxError::EndOfStream),
        }
    }

    /// Send one payload chunk as exactly one message.
    ///
    /// # Errors
    ///
    /// - [`MuxError::EndOfStream`] if the stream is closed
    /// - [`MuxError::Protocol`] if the stream is not yet established
    /// - [`MuxError::SessionClosed`] / [`MuxError::ConnectionClosed`] if the
    ///   session is gone
    pub async fn write_message(&self, data: impl Into<Bytes>) -> Result<()> {
        match self.state() {
            StreamState::Closed => return Err(MuxError::EndOfStream),
            StreamState::Pending => {
                return Err(MuxError::Protocol(format!(
                    "stream {} is not established",
                    self.connection_id()
                )))
            }
            StreamState::Established => {}
        }

        let session = self.session()?;
        session
            .send(Message::payload(self.connection_id(), data))
            .await
    }

    /// Byte-stream style write; the whole slice is sent as one chunk.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.write_message(Bytes::copy_from_slice(buf)).await?;
        Ok(buf.len())
    }

    /// Close the stream.
    ///
    /// The first call removes the stream from its session and tells the peer
    /// (`ConnClosed`); later calls, and calls after the peer already closed
    /// the stream, return `Ok(())` without doing anything.
    pub async fn close(&self) -> Result<()> {
        if !self.mark_closed() {
            return Ok(());
        }
        tracing::debug!("Closing stream {}", self.connection_id());

        match self.shared.session.upgrade() {
            Some(session) => session.notify_closed(self).await,
            None => Ok(()),
        }
    }

    /// Adapt this handle to tokio's `AsyncRead` and `AsyncWrite`.
    ///
    /// End-of-stream reads as `Ok(0)` and `shutdown` closes the stream.
    pub fn into_io(self) -> StreamIo {
        StreamIo::new(self)
    }

    /// Enqueue an inbound payload chunk.
    ///
    /// Returns `false` if the stream is already closed, or closes while the
    /// queue is full. Only the dispatch loop calls this.
    pub(crate) async fn put_message(&self, message: Message) -> bool {
        if self.is_closed() {
            return false;
        }

        let mut closed = self.shared.closed_signal.subscribe();
        tokio::select! {
            sent = self.shared.tx.send(message.data) => sent.is_ok(),
            _ = closed.wait_for(|closed| *closed) => false,
        }
    }

    /// Mark a pending stream established and wake `open_stream`.
    ///
    /// Returns `false` if it was not pending.
    pub(crate) fn mark_established(&self) -> bool {
        if self.is_closed() || self.shared.established.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(tx) = lock(&self.shared.establish).take() {
            let _ = tx.send(Ok(()));
        }
        true
    }

    /// Fail a pending establishment with a specific error.
    pub(crate) fn fail_establishment(&self, error: MuxError) {
        if let Some(tx) = lock(&self.shared.establish).take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Force-close without notifying the peer.
    ///
    /// Used when the peer already knows (remote close, routing miss) or the
    /// whole session is going away.
    pub(crate) fn close_notify(&self) {
        if self.mark_closed() {
            tracing::debug!("Stream {} closed by peer or session", self.connection_id());
        }
    }

    /// Flip the closed flag; true only for the first caller.
    fn mark_closed(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.closed_signal.send_replace(true);
        // Dropping the sender wakes a pending open_stream
        drop(lock(&self.shared.establish).take());
        true
    }

    fn session(&self) -> Result<Arc<SessionInner>> {
        self.shared.session.upgrade().ok_or(MuxError::SessionClosed)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("connection_id", &self.shared.connection_id)
            .field("other_client", &self.shared.other_client)
            .field("protocol", &self.shared.protocol)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn detached(capacity: usize) -> Stream {
        Stream::established("t:0", "peer", "test", capacity, Weak::new())
    }

    async fn put(stream: &Stream, data: &'static [u8]) -> bool {
        stream.put_message(Message::payload("t:0", data)).await
    }

    #[tokio::test]
    async fn test_read_message_returns_chunks_in_order() {
        let stream = detached(8);
        assert!(put(&stream, b"one").await);
        assert!(put(&stream, b"two").await);

        assert_eq!(&stream.read_message().await.unwrap()[..], b"one");
        assert_eq!(&stream.read_message().await.unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn test_partial_reads_keep_remainder() {
        let stream = detached(8);
        assert!(put(&stream, b"hello world").await);

        let mut buf = [0u8; 5];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"hello");

        // The remainder of the chunk comes back whole from read_message
        assert_eq!(&stream.read_message().await.unwrap()[..], b" world");
    }

    #[tokio::test]
    async fn test_read_spans_queued_chunks_without_waiting() {
        let stream = detached(8);
        assert!(put(&stream, b"ab").await);
        assert!(put(&stream, b"cd").await);

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
    }

    #[tokio::test]
    async fn test_empty_read_does_not_block_or_consume() {
        let stream = detached(8);
        let mut empty = [0u8; 0];
        assert_eq!(stream.read(&mut empty).await.unwrap(), 0);

        assert!(put(&stream, b"x").await);
        assert_eq!(stream.read(&mut empty).await.unwrap(), 0);
        assert_eq!(&stream.read_message().await.unwrap()[..], b"x");
    }

    #[tokio::test]
    async fn test_close_drains_then_eof() {
        let stream = detached(8);
        assert!(put(&stream, b"queued").await);
        stream.close_notify();

        assert_eq!(stream.state(), StreamState::Closed);
        assert!(!put(&stream, b"late").await);
        assert_eq!(&stream.read_message().await.unwrap()[..], b"queued");
        assert!(matches!(
            stream.read_message().await,
            Err(MuxError::EndOfStream)
        ));
    }

    #[tokio::test]
    async fn test_close_unblocks_waiting_reader() {
        let stream = detached(8);
        let reader = stream.clone();
        let task = tokio::spawn(async move { reader.read_message().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.close_notify();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reader should be released")
            .unwrap();
        assert!(matches!(result, Err(MuxError::EndOfStream)));
    }

    #[tokio::test]
    async fn test_put_on_full_queue_released_by_close() {
        let stream = detached(1);
        assert!(put(&stream, b"fills the queue").await);

        let blocked = stream.clone();
        let task = tokio::spawn(async move { put(&blocked, b"waits").await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        stream.close_notify();

        let delivered = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!delivered);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_without_session() {
        let stream = detached(8);
        stream.close().await.unwrap();
        stream.close().await.unwrap();
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_write_after_close_is_eof() {
        let stream = detached(8);
        stream.close_notify();
        assert!(matches!(
            stream.write_message(&b"nope"[..]).await,
            Err(MuxError::EndOfStream)
        ));
    }

    #[tokio::test]
    async fn test_establishment_signals() {
        let (stream, established) = Stream::pending("t:1", "peer", "echo", 8, Weak::new());
        assert_eq!(stream.state(), StreamState::Pending);
        assert!(matches!(
            stream.write_message(&b"early"[..]).await,
            Err(MuxError::Protocol(_))
        ));

        assert!(stream.mark_established());
        assert!(!stream.mark_established());
        assert!(established.await.unwrap().is_ok());
        assert!(stream.is_established());
    }

    #[tokio::test]
    async fn test_pending_close_wakes_establishment() {
        let (stream, established) = Stream::pending("t:2", "peer", "echo", 8, Weak::new());
        stream.close_notify();
        assert!(established.await.is_err());
        assert!(!stream.mark_established());
    }

    #[tokio::test]
    async fn test_fail_establishment_carries_error() {
        let (stream, established) = Stream::pending("t:3", "peer", "nope", 8, Weak::new());
        stream.fail_establishment(MuxError::UnknownProtocol("nope".to_string()));
        assert!(matches!(
            established.await.unwrap(),
            Err(MuxError::UnknownProtocol(p)) if p == "nope"
        ));
    }
}
