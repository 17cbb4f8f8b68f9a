//! Framing helpers for accumulating partial reads.
//!
//! Codecs encode one [`Message`](super::Message) per frame. Two framings are
//! provided, both operating on a `bytes::BytesMut` buffer that the session
//! reader fills from the transport:
//!
//! - **Length-prefixed** (binary codecs): a 4-byte big-endian body length
//!   followed by the body.
//! - **Line-delimited** (text codecs): the body followed by `\n`.
//!
//! ```text
//! ┌──────────┬──────────────┐      ┌──────────────┬────┐
//! │ Length   │ Body         │      │ Body         │ \n │
//! │ u32 BE   │ Length bytes │      │ no raw \n    │    │
//! └──────────┴──────────────┘      └──────────────┴────┘
//! ```
//!
//! The split functions are pure: they either remove exactly one complete
//! frame from the front of the buffer or leave it untouched and return
//! `Ok(None)` so the caller can read more bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MuxError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum frame body size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Append a length-prefixed frame to `dst`.
///
/// # Errors
///
/// Returns [`MuxError::FrameTooLarge`] if `body` exceeds `max_frame_size`.
pub fn encode_length_prefixed(body: &[u8], dst: &mut BytesMut, max_frame_size: usize) -> Result<()> {
    check_size(body.len(), max_frame_size)?;
    dst.reserve(LENGTH_PREFIX_SIZE + body.len());
    dst.put_u32(body.len() as u32);
    dst.extend_from_slice(body);
    Ok(())
}

/// Try to remove one length-prefixed frame body from the front of `src`.
///
/// Returns `Ok(None)` while the header or body is incomplete.
///
/// # Errors
///
/// Returns [`MuxError::FrameTooLarge`] as soon as the header announces a body
/// larger than `max_frame_size`, before the body has arrived.
pub fn split_length_prefixed(src: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>> {
    if src.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    // Peek, don't consume yet
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    check_size(len, max_frame_size)?;

    if src.len() < LENGTH_PREFIX_SIZE + len {
        src.reserve(LENGTH_PREFIX_SIZE + len - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_SIZE);
    Ok(Some(src.split_to(len).freeze()))
}

/// Append a line-delimited frame to `dst`.
///
/// # Errors
///
/// Returns [`MuxError::FrameTooLarge`] if `body` exceeds `max_frame_size`,
/// or [`MuxError::Protocol`] if `body` contains a raw newline.
pub fn encode_line(body: &[u8], dst: &mut BytesMut, max_frame_size: usize) -> Result<()> {
    check_size(body.len(), max_frame_size)?;
    if body.contains(&b'\n') {
        return Err(MuxError::Protocol(
            "line-delimited frame body contains a newline".to_string(),
        ));
    }
    dst.reserve(body.len() + 1);
    dst.extend_from_slice(body);
    dst.put_u8(b'\n');
    Ok(())
}

/// Try to remove one non-empty line from the front of `src`.
///
/// The trailing `\n` (and a preceding `\r`, if any) is stripped. Blank lines
/// are skipped.
///
/// # Errors
///
/// Returns [`MuxError::FrameTooLarge`] if no newline appears within
/// `max_frame_size` bytes.
pub fn split_line(src: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>> {
    loop {
        let Some(pos) = src.iter().position(|&b| b == b'\n') else {
            if src.len() > max_frame_size {
                return Err(MuxError::FrameTooLarge {
                    size: src.len(),
                    max: max_frame_size,
                });
            }
            return Ok(None);
        };

        let mut line = src.split_to(pos + 1);
        line.truncate(pos);
        if line.last() == Some(&b'\r') {
            line.truncate(pos - 1);
        }

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        check_size(line.len(), max_frame_size)?;
        return Ok(Some(line.freeze()));
    }
}

#[inline]
fn check_size(size: usize, max: usize) -> Result<()> {
    if size > max {
        return Err(MuxError::FrameTooLarge { size, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_frame_bytes(body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_length_prefixed(body, &mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap();
        buf
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buf = make_frame_bytes(b"hello");
        assert_eq!(buf.len(), LENGTH_PREFIX_SIZE + 5);

        let frame = split_length_prefixed(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        for body in [&b"first"[..], b"second", b"third"] {
            encode_length_prefixed(body, &mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap();
        }

        let mut frames = Vec::new();
        while let Some(frame) = split_length_prefixed(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
            frames.push(frame);
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[1][..], b"second");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_fragmented_header() {
        let full = make_frame_bytes(b"test");
        let mut buf = BytesMut::from(&full[..2]);

        assert!(split_length_prefixed(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .is_none());
        assert_eq!(buf.len(), 2, "partial header must not be consumed");

        buf.extend_from_slice(&full[2..]);
        let frame = split_length_prefixed(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        assert_eq!(&frame[..], b"test");
    }

    #[test]
    fn test_byte_at_a_time() {
        let full = make_frame_bytes(b"hi there");
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();

        for byte in full.iter() {
            buf.put_u8(*byte);
            if let Some(frame) = split_length_prefixed(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
                frames.push(frame);
            }
        }

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"hi there");
    }

    #[test]
    fn test_empty_body() {
        let mut buf = make_frame_bytes(b"");
        let frame = split_length_prefixed(&mut buf, DEFAULT_MAX_FRAME_SIZE)
            .unwrap()
            .unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_max_size_validation() {
        let mut buf = BytesMut::new();
        buf.put_u32(1000);

        let result = split_length_prefixed(&mut buf, 100);
        assert!(matches!(
            result,
            Err(MuxError::FrameTooLarge { size: 1000, max: 100 })
        ));

        let mut out = BytesMut::new();
        assert!(encode_length_prefixed(&[0u8; 101], &mut out, 100).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_line_split_and_crlf() {
        let mut buf = BytesMut::from(&b"{\"a\":1}\r\n\n{\"b\":2}\n{\"c\""[..]);

        let first = split_line(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(&first[..], b"{\"a\":1}");

        // Blank line is skipped
        let second = split_line(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(&second[..], b"{\"b\":2}");

        // Incomplete trailing line stays buffered
        assert!(split_line(&mut buf, 1024).unwrap().is_none());
        assert_eq!(&buf[..], b"{\"c\"");
    }

    #[test]
    fn test_line_too_long_without_newline() {
        let mut buf = BytesMut::from(&[b'x'; 64][..]);
        assert!(matches!(
            split_line(&mut buf, 32),
            Err(MuxError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_encode_line_rejects_newline() {
        let mut buf = BytesMut::new();
        assert!(encode_line(b"a\nb", &mut buf, 1024).is_err());

        encode_line(b"ab", &mut buf, 1024).unwrap();
        assert_eq!(&buf[..], b"ab\n");
    }
}
