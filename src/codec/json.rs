//! JSON codec using `serde_json`.
//!
//! Each message is one compact JSON object terminated by `\n`:
//!
//! ```text
//! {"Meta":10,"OtherClient":"alice","ConnectionID":"alice:0","Data":[101,99,104,111]}
//! ```
//!
//! `Data` is written as an array of byte values. On decode it also accepts a
//! string (taken as its UTF-8 bytes) or `null` (empty data), so hand-written
//! lines are easy to feed in while debugging.

use bytes::BytesMut;

use super::Codec;
use crate::error::Result;
use crate::protocol::{encode_line, split_line, Message, WireMessage, DEFAULT_MAX_FRAME_SIZE};

/// Human-readable structured-text codec.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    max_frame_size: usize,
}

impl JsonCodec {
    /// Create a codec with the given line length limit.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Maximum line length accepted in either direction.
    #[inline]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        // Compact output never contains a raw newline.
        let body = serde_json::to_vec(&message.as_wire())?;
        encode_line(&body, dst, self.max_frame_size)
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>> {
        let Some(line) = split_line(src, self.max_frame_size)? else {
            return Ok(None);
        };
        let wire: WireMessage = serde_json::from_slice(&line)?;
        Ok(Some(Message::try_from(wire)?))
    }

    // Padding after the last newline is not a message
    fn is_clean_eof(&self, remainder: &[u8]) -> bool {
        remainder.iter().all(u8::is_ascii_whitespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MuxError;
    use crate::protocol::Meta;

    #[test]
    fn test_encode_is_single_line() {
        let codec = JsonCodec::default();
        let msg = Message::new(Meta::ConnSyn, "alice", "alice:0", "echo\nwith newline");

        let mut buf = BytesMut::new();
        codec.encode(&msg, &mut buf).unwrap();

        assert_eq!(buf.iter().filter(|&&b| b == b'\n').count(), 1);
        assert_eq!(buf.last(), Some(&b'\n'));

        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.starts_with("{\"Meta\":10,\"OtherClient\":\"alice\""));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let codec = JsonCodec::default();
        let msg = Message::new(Meta::None, "", "bob:7", &b"\x00\xffbinary"[..]);

        let mut buf = BytesMut::new();
        codec.encode(&msg, &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_hand_written_lines() {
        let codec = JsonCodec::default();
        let mut buf = BytesMut::from(
            &b"{\"Meta\":7,\"OtherClient\":\"carol\",\"ConnectionID\":\"\",\"Data\":\"secret\"}\n\
               {\"Meta\":6,\"OtherClient\":\"carol\",\"ConnectionID\":\"carol:1\",\"Data\":null}\n"[..],
        );

        let auth = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(auth.meta, Meta::Auth);
        assert_eq!(&auth.data[..], b"secret");

        let closed = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(closed.meta, Meta::ConnClosed);
        assert!(closed.data.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_line_waits() {
        let codec = JsonCodec::default();
        let mut buf = BytesMut::from(&b"{\"Meta\":0,\"ConnectionID\":\"x\""[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b",\"Data\":[104,105]}\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&msg.data[..], b"hi");
        assert!(msg.other_client.is_empty());
    }

    #[test]
    fn test_unknown_meta_surfaces() {
        let codec = JsonCodec::default();
        let mut buf = BytesMut::from(&b"{\"Meta\":99}\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(MuxError::UnknownMeta(99))
        ));
    }

    #[test]
    fn test_invalid_json() {
        let codec = JsonCodec::default();
        let mut buf = BytesMut::from(&b"not json\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(MuxError::Json(_))));
    }
}
