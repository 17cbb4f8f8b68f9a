//! Codec module - turning a [`Message`] into bytes on the wire and back.
//!
//! This module provides two interchangeable codecs:
//!
//! - [`MsgPackCodec`] - compact binary, MessagePack body in a length-prefixed frame
//! - [`JsonCodec`] - human-readable, one JSON object per line
//!
//! # Design
//!
//! Codecs implement the [`Codec`] capability trait and are shared by a session
//! as `Arc<dyn Codec>`. They are stateless: `encode` appends one frame to a
//! buffer and `decode` removes at most one frame from the front of a buffer.
//! The session owns the buffers and guarantees a single writer and a single
//! reader, so codecs never need internal locking.
//!
//! Peers must agree on a codec out of band; nothing is negotiated.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use muxwire::codec::{Codec, CodecKind};
//! use muxwire::protocol::{Message, Meta};
//!
//! let codec = CodecKind::Json.build(1024);
//! let msg = Message::new(Meta::ConnSyn, "alice", "alice:0", "echo");
//!
//! let mut buf = BytesMut::new();
//! codec.encode(&msg, &mut buf).unwrap();
//! assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));
//! ```

mod json;
mod msgpack;
mod reader;

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;

use crate::error::Result;
use crate::protocol::Message;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;
pub use reader::MessageReader;

/// A wire encoding for [`Message`] records.
pub trait Codec: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Append exactly one encoded message to `dst`.
    ///
    /// On error `dst` is left as it was.
    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<()>;

    /// Remove one complete message from the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>>;

    /// Whether undecoded bytes left when the transport closes can be
    /// discarded instead of reported as a truncated frame.
    fn is_clean_eof(&self, remainder: &[u8]) -> bool {
        remainder.is_empty()
    }
}

/// Built-in codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    /// Compact binary encoding.
    #[default]
    MsgPack,
    /// Newline-delimited JSON.
    Json,
}

impl CodecKind {
    /// Instantiate the codec with the given frame size limit.
    pub fn build(self, max_frame_size: usize) -> Arc<dyn Codec> {
        match self {
            CodecKind::MsgPack => Arc::new(MsgPackCodec::new(max_frame_size)),
            CodecKind::Json => Arc::new(JsonCodec::new(max_frame_size)),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::MsgPack => f.write_str("msgpack"),
            CodecKind::Json => f.write_str("json"),
        }
    }
}
