//! Protocol module - the wire record and its framing.
//!
//! This module implements the pieces every codec shares:
//! - [`Message`] and the [`Meta`] control taxonomy
//! - Length-prefixed and line-delimited framing over a `BytesMut` buffer

mod framing;
mod message;

pub use framing::{
    encode_length_prefixed, encode_line, split_length_prefixed, split_line,
    DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE,
};
pub use message::{Message, Meta};

pub(crate) use message::{WireMessage, WireMessageRef};
