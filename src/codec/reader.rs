//! Decoding messages from an async byte stream.
//!
//! [`MessageReader`] accumulates partial reads in a `BytesMut` buffer and asks
//! the codec for complete messages, so a frame split across any number of
//! transport reads decodes exactly once.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::Codec;
use crate::error::Result;
use crate::protocol::Message;

/// Initial read buffer capacity (64KB).
const READ_BUFFER_CAPACITY: usize = 64 * 1024;

/// Reads whole messages from the read half of a transport.
pub struct MessageReader<R> {
    reader: R,
    buffer: BytesMut,
    codec: Arc<dyn Codec>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap a reader with the given codec.
    pub fn new(reader: R, codec: Arc<dyn Codec>) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            codec,
        }
    }

    /// Wait for the next complete message.
    ///
    /// Returns `Ok(None)` when the transport closes cleanly between messages.
    ///
    /// # Errors
    ///
    /// - I/O errors from the transport, including `UnexpectedEof` if it closes
    ///   in the middle of a frame
    /// - codec errors for malformed or oversized frames
    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(message));
            }

            if self.buffer.capacity() - self.buffer.len() < 1024 {
                self.buffer.reserve(READ_BUFFER_CAPACITY);
            }

            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.codec.is_clean_eof(&self.buffer) {
                    self.buffer.clear();
                    return Ok(None); // Connection closed
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "transport closed in the middle of a frame",
                )
                .into());
            }
        }
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Give back the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecKind;
    use crate::error::MuxError;
    use crate::protocol::Meta;
    use tokio::io::{duplex, AsyncWriteExt};

    fn encode_all(codec: &Arc<dyn Codec>, messages: &[Message]) -> BytesMut {
        let mut buf = BytesMut::new();
        for msg in messages {
            codec.encode(msg, &mut buf).unwrap();
        }
        buf
    }

    #[tokio::test]
    async fn test_reads_messages_in_order_then_eof() {
        for kind in [CodecKind::MsgPack, CodecKind::Json] {
            let codec = kind.build(1024 * 1024);
            let messages: Vec<Message> = (0..5)
                .map(|i| Message::new(Meta::None, "a", format!("a:{}", i), format!("chunk {}", i)))
                .collect();
            let bytes = encode_all(&codec, &messages);

            let (mut client, server) = duplex(64);
            let writer = tokio::spawn(async move {
                // Small writes so frames straddle reads
                for piece in bytes.chunks(7) {
                    client.write_all(piece).await.unwrap();
                }
            });

            let mut reader = MessageReader::new(server, codec.clone());
            for expected in &messages {
                let got = reader.read_message().await.unwrap().unwrap();
                assert_eq!(&got, expected);
            }
            writer.await.unwrap();
            assert!(reader.read_message().await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_error() {
        let codec = CodecKind::MsgPack.build(1024);
        let bytes = encode_all(&codec, &[Message::payload("x", &b"data"[..])]);

        let (mut client, server) = duplex(1024);
        client.write_all(&bytes[..bytes.len() - 1]).await.unwrap();
        drop(client);

        let mut reader = MessageReader::new(server, codec);
        match reader.read_message().await {
            Err(MuxError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_json_trailing_whitespace_is_clean_eof() {
        let codec = CodecKind::Json.build(1024);
        let mut bytes = encode_all(&codec, &[Message::payload("x", &b"data"[..])]);
        bytes.extend_from_slice(b"  \t\r");

        let (mut client, server) = duplex(1024);
        client.write_all(&bytes).await.unwrap();
        drop(client);

        let mut reader = MessageReader::new(server, codec);
        assert!(reader.read_message().await.unwrap().is_some());
        assert!(reader.read_message().await.unwrap().is_none());
        assert_eq!(reader.buffered(), 0);
    }

    #[tokio::test]
    async fn test_json_partial_line_at_eof_is_error() {
        let codec = CodecKind::Json.build(1024);

        let (mut client, server) = duplex(1024);
        client.write_all(b" {\"Meta\":0").await.unwrap();
        drop(client);

        let mut reader = MessageReader::new(server, codec);
        match reader.read_message().await {
            Err(MuxError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
    }
}
