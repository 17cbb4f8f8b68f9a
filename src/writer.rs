//! Dedicated writer task: the single serialized write path of a session.
//!
//! Every outbound message is encoded by its sender into an [`OutboundFrame`]
//! and queued on an mpsc channel. One task owns the write half of the
//! transport and drains the channel, so physical writes never interleave no
//! matter how many streams send concurrently.
//!
//! # Architecture
//!
//! ```text
//! Stream 1 ─┐
//! Stream 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Transport
//! Dispatch ─┘
//! ```
//!
//! Frames are written in the order they were queued. Several ready frames are
//! batched into one vectored write.

use std::io::IoSlice;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{MuxError, Result};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default time allowed for flushing and shutting down the transport on close.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A fully encoded message ready to be written to the transport.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    bytes: Bytes,
}

impl OutboundFrame {
    /// Wrap already-encoded bytes.
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    /// Total size of this frame.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Encoded bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// Upper bound for the final flush + shutdown when the session closes.
    pub shutdown_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and shared by the session and all its streams.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame, waiting for channel capacity.
    ///
    /// # Errors
    ///
    /// [`MuxError::ConnectionClosed`] once the writer task has stopped.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| MuxError::ConnectionClosed)
    }

    /// Queue a frame without waiting.
    ///
    /// Used from synchronous contexts such as `Drop` impls.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                MuxError::Protocol("writer queue is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => MuxError::ConnectionClosed,
        })
    }

    /// True once the writer task has stopped accepting frames.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task runs until `shutdown` turns `true`; it then writes every frame
/// already queued, flushes, and shuts the transport down.
///
/// # Returns
///
/// A tuple of `(WriterHandle, JoinHandle)`; the JoinHandle resolves with the
/// first I/O error, or `Ok(())` after a clean shutdown.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
    shutdown: watch::Receiver<bool>,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let task = tokio::spawn(writer_loop(rx, writer, shutdown, config.shutdown_timeout));
    (WriterHandle { tx }, task)
}

/// Main writer loop - receives frames and writes them to the transport.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    mut shutdown: watch::Receiver<bool>,
    shutdown_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        // Queued frames win over the shutdown signal
        let first = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = shutdown.wait_for(|closed| *closed) => None,
        };

        let Some(first) = first else {
            return finish(rx, writer, shutdown_timeout).await;
        };

        // Collect additional ready frames (non-blocking)
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        // A peer that stops reading must not hold a closing session hostage
        let stopping = {
            let write = write_batch(&mut writer, &batch);
            tokio::pin!(write);
            let interrupted = tokio::select! {
                biased;
                result = &mut write => {
                    result?;
                    false
                }
                _ = shutdown.wait_for(|closed| *closed) => true,
            };
            if interrupted {
                match tokio::time::timeout(shutdown_timeout, write).await {
                    Ok(result) => result?,
                    Err(_) => return Err(flush_timed_out()),
                }
            }
            interrupted
        };

        if stopping {
            return finish(rx, writer, shutdown_timeout).await;
        }
    }
}

/// Write whatever is still queued, then shut the transport down.
async fn finish<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    shutdown_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    rx.close();
    let mut rest = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        rest.push(frame);
    }

    let flush = async {
        write_batch(&mut writer, &rest).await?;
        writer.shutdown().await?;
        Ok::<_, MuxError>(())
    };
    match tokio::time::timeout(shutdown_timeout, flush).await {
        Ok(result) => result,
        Err(_) => Err(flush_timed_out()),
    }
}

fn flush_timed_out() -> MuxError {
    MuxError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "timed out flushing transport on shutdown",
    ))
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(MuxError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after a partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut skipped = 0;

    for frame in batch {
        let start = skipped;
        let end = skipped + frame.size();

        if skip_bytes < end && frame.size() > 0 {
            let start_in_frame = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&frame.bytes[start_in_frame..]));
        }
        skipped = end;
    }

    slices
}
