//! `AsyncRead`/`AsyncWrite` over a [`Stream`].
//!
//! Each `poll_write` commits its buffer as one payload chunk. The send itself
//! may still be in flight when `poll_write` returns; it is driven to
//! completion by the next write, `flush`, or `shutdown`, and its error (if
//! any) surfaces there.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::Stream;
use crate::error::{MuxError, Result};
use crate::handler::BoxFuture;

/// Byte-stream adapter returned by [`Stream::into_io`].
pub struct StreamIo {
    stream: Stream,
    leftover: Bytes,
    eof: bool,
    read: Option<BoxFuture<'static, Result<Bytes>>>,
    write: Option<BoxFuture<'static, Result<()>>>,
    shutdown: Option<BoxFuture<'static, Result<()>>>,
}

impl StreamIo {
    pub(super) fn new(stream: Stream) -> Self {
        Self {
            stream,
            leftover: Bytes::new(),
            eof: false,
            read: None,
            write: None,
            shutdown: None,
        }
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &Stream {
        &self.stream
    }

    /// Unwrap the stream, dropping any in-flight operation and unread bytes.
    pub fn into_inner(self) -> Stream {
        self.stream
    }

    fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(write) = self.write.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(write.as_mut().poll(cx));
        self.write = None;
        Poll::Ready(result.map_err(into_io_error))
    }
}

fn into_io_error(error: MuxError) -> io::Error {
    match error {
        MuxError::Io(e) => e,
        MuxError::EndOfStream | MuxError::ConnectionClosed | MuxError::SessionClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, error)
        }
        other => io::Error::other(other),
    }
}

impl AsyncRead for StreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // Empty chunks carry nothing; skip them rather than report EOF
        while this.leftover.is_empty() {
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            let read = this.read.get_or_insert_with(|| {
                let stream = this.stream.clone();
                Box::pin(async move { stream.read_message().await })
            });
            let result = ready!(read.as_mut().poll(cx));
            this.read = None;

            match result {
                Ok(chunk) => this.leftover = chunk,
                Err(MuxError::EndOfStream) => this.eof = true,
                Err(e) => return Poll::Ready(Err(into_io_error(e))),
            }
        }

        let n = this.leftover.len().min(buf.remaining());
        buf.put_slice(&this.leftover.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for StreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_pending_write(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let stream = this.stream.clone();
        let data = Bytes::copy_from_slice(buf);
        let mut write: BoxFuture<'static, Result<()>> =
            Box::pin(async move { stream.write_message(data).await });

        match write.as_mut().poll(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(into_io_error(e))),
            Poll::Ready(Ok(())) => {}
            Poll::Pending => this.write = Some(write),
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_pending_write(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_pending_write(cx))?;

        let shutdown = this.shutdown.get_or_insert_with(|| {
            let stream = this.stream.clone();
            Box::pin(async move { stream.close().await })
        });
        let result = ready!(shutdown.as_mut().poll(cx));
        this.shutdown = None;
        Poll::Ready(result.map_err(into_io_error))
    }
}

impl fmt::Debug for StreamIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamIo")
            .field("stream", &self.stream)
            .field("buffered", &self.leftover.len())
            .field("eof", &self.eof)
            .finish()
    }
}
