//! MsgPack codec using `rmp-serde`.
//!
//! **CRITICAL**: Always use `to_vec_named`, NEVER `to_vec`!
//! The record is keyed by field name (`Meta`, `OtherClient`, `ConnectionID`,
//! `Data`) so both codecs share one schema and the decoder tolerates field
//! reordering. `to_vec` would emit a positional array instead.
//!
//! Each encoded record is wrapped in a 4-byte big-endian length prefix.

use bytes::BytesMut;

use super::Codec;
use crate::error::Result;
use crate::protocol::{
    encode_length_prefixed, split_length_prefixed, Message, WireMessage, DEFAULT_MAX_FRAME_SIZE,
};

/// Compact binary codec.
#[derive(Debug, Clone)]
pub struct MsgPackCodec {
    max_frame_size: usize,
}

impl MsgPackCodec {
    /// Create a codec with the given frame body limit.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Maximum frame body size accepted in either direction.
    #[inline]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for MsgPackCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Codec for MsgPackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        // CRITICAL: to_vec_named, NOT to_vec!
        let body = rmp_serde::to_vec_named(&message.as_wire())?;
        encode_length_prefixed(&body, dst, self.max_frame_size)
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>> {
        let Some(body) = split_length_prefixed(src, self.max_frame_size)? else {
            return Ok(None);
        };
        let wire: WireMessage = rmp_serde::from_slice(&body)?;
        Ok(Some(Message::try_from(wire)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MuxError;
    use crate::protocol::{Meta, LENGTH_PREFIX_SIZE};
    use bytes::BufMut;

    #[test]
    fn test_encode_decode_payload() {
        let codec = MsgPackCodec::default();
        let msg = Message::new(Meta::None, "alice", "alice:0", &b"ping"[..]);

        let mut buf = BytesMut::new();
        codec.encode(&msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_body_is_named_map() {
        let codec = MsgPackCodec::default();
        let msg = Message::new(Meta::Auth, "a", "", &b"x"[..]);

        let mut buf = BytesMut::new();
        codec.encode(&msg, &mut buf).unwrap();

        // fixmap with 4 entries right after the length prefix
        assert_eq!(buf[LENGTH_PREFIX_SIZE], 0x84, "Expected fixmap with 4 elements");
    }

    #[test]
    fn test_data_encoded_as_bin() {
        let codec = MsgPackCodec::default();
        let msg = Message::payload("c", vec![0x01, 0x02, 0x03]);

        let mut buf = BytesMut::new();
        codec.encode(&msg, &mut buf).unwrap();

        // "Data" key followed by bin8 (0xc4), length 3
        let needle = [0xa4, b'D', b'a', b't', b'a', 0xc4, 0x03];
        assert!(buf.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn test_partial_frame_waits() {
        let codec = MsgPackCodec::default();
        let msg = Message::payload("c:1", &b"fragmented payload"[..]);

        let mut full = BytesMut::new();
        codec.encode(&msg, &mut full).unwrap();

        let mut buf = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 3..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_unknown_meta_surfaces() {
        #[derive(serde::Serialize)]
        struct Raw<'a> {
            #[serde(rename = "Meta")]
            meta: u8,
            #[serde(rename = "OtherClient")]
            other_client: &'a str,
            #[serde(rename = "ConnectionID")]
            connection_id: &'a str,
        }

        let body = rmp_serde::to_vec_named(&Raw {
            meta: 42,
            other_client: "x",
            connection_id: "y",
        })
        .unwrap();
        let mut buf = BytesMut::new();
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(&body);

        let err = MsgPackCodec::default().decode(&mut buf).unwrap_err();
        assert!(matches!(err, MuxError::UnknownMeta(42)));
    }

    #[test]
    fn test_decode_error_on_invalid_body() {
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.extend_from_slice(b"junk");

        let result = MsgPackCodec::default().decode(&mut buf);
        assert!(matches!(result, Err(MuxError::MsgPackDecode(_))));
    }

    #[test]
    fn test_frame_too_large() {
        let codec = MsgPackCodec::new(16);
        let msg = Message::payload("c", vec![0u8; 64]);

        let mut buf = BytesMut::new();
        let err = codec.encode(&msg, &mut buf).unwrap_err();
        assert!(matches!(err, MuxError::FrameTooLarge { .. }));
        assert!(buf.is_empty());
    }
}
