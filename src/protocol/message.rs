//! The atomic unit exchanged over a session transport.
//!
//! A [`Message`] either carries stream payload (`Meta::None`) or a control
//! directive. On the wire it is a four-field record:
//!
//! ```text
//! ┌──────┬─────────────┬──────────────┬──────┐
//! │ Meta │ OtherClient │ ConnectionID │ Data │
//! │ u8   │ string      │ string       │ bytes│
//! └──────┴─────────────┴──────────────┴──────┘
//! ```
//!
//! The field names above are the serialized keys for both codecs.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::MuxError;

/// Intent of a message.
///
/// `None` messages are delivered to a stream; every other kind is handled by
/// the session's control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Meta {
    /// Payload frame for an established stream.
    None = 0,
    /// Malformed or unexpected control message. Never answered.
    Wat = 1,
    /// The sender has no record of the referenced connection.
    NoSuchConnection = 2,
    /// The sender has no handler for the requested protocol.
    UnknownProto = 3,
    /// The sending peer is shutting down its whole session.
    ClientClosed = 4,
    /// Stream accepted and established.
    ConnAck = 5,
    /// The sender closed the referenced stream.
    ConnClosed = 6,
    /// Authentication attempt carrying credential bytes.
    Auth = 7,
    /// Authentication accepted.
    AuthOk = 8,
    /// Authentication rejected; data carries the reason.
    AuthFailure = 9,
    /// Request to open a stream; data carries the protocol name.
    ConnSyn = 10,
}

impl Meta {
    /// Wire value of this kind.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for every kind except `None`.
    #[inline]
    pub fn is_control(self) -> bool {
        self != Meta::None
    }

    /// True for the kinds a session accepts before it is authenticated.
    #[inline]
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Meta::Auth | Meta::AuthOk | Meta::AuthFailure | Meta::Wat
        )
    }
}

impl TryFrom<u8> for Meta {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Meta::None,
            1 => Meta::Wat,
            2 => Meta::NoSuchConnection,
            3 => Meta::UnknownProto,
            4 => Meta::ClientClosed,
            5 => Meta::ConnAck,
            6 => Meta::ConnClosed,
            7 => Meta::Auth,
            8 => Meta::AuthOk,
            9 => Meta::AuthFailure,
            10 => Meta::ConnSyn,
            other => return Err(MuxError::UnknownMeta(other)),
        })
    }
}

impl From<Meta> for u8 {
    fn from(meta: Meta) -> u8 {
        meta.as_u8()
    }
}

/// A single wire record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Payload (`Meta::None`) or control kind.
    pub meta: Meta,
    /// Name of the peer this message concerns.
    ///
    /// Sessions stamp their own name here on every outbound message, so the
    /// receiver always sees the remote peer's name.
    pub other_client: String,
    /// Logical stream within the session.
    pub connection_id: String,
    /// Payload bytes or control argument.
    pub data: Bytes,
}

impl Message {
    /// Create a message with every field given.
    pub fn new(
        meta: Meta,
        other_client: impl Into<String>,
        connection_id: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            meta,
            other_client: other_client.into(),
            connection_id: connection_id.into(),
            data: data.into(),
        }
    }

    /// Payload message for a stream.
    pub fn payload(connection_id: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::new(Meta::None, String::new(), connection_id, data)
    }

    /// Control message for a stream (or for the session when the id is empty).
    pub fn control(
        meta: Meta,
        connection_id: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self::new(meta, String::new(), connection_id, data)
    }

    /// Data interpreted as UTF-8 text (lossy), used for reasons and protocol names.
    pub fn data_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub(crate) fn as_wire(&self) -> WireMessageRef<'_> {
        WireMessageRef {
            meta: self.meta.as_u8(),
            other_client: &self.other_client,
            connection_id: &self.connection_id,
            data: serde_bytes::Bytes::new(&self.data[..]),
        }
    }
}

/// Borrowed serialized form used when encoding.
#[derive(Serialize)]
pub(crate) struct WireMessageRef<'a> {
    #[serde(rename = "Meta")]
    meta: u8,
    #[serde(rename = "OtherClient")]
    other_client: &'a str,
    #[serde(rename = "ConnectionID")]
    connection_id: &'a str,
    #[serde(rename = "Data")]
    data: &'a serde_bytes::Bytes,
}

/// Owned serialized form used when decoding.
///
/// The kind stays a raw byte here so an unknown value surfaces as
/// [`MuxError::UnknownMeta`] instead of a generic decode error.
#[derive(Deserialize)]
pub(crate) struct WireMessage {
    #[serde(rename = "Meta")]
    meta: u8,
    #[serde(rename = "OtherClient", default)]
    other_client: String,
    #[serde(rename = "ConnectionID", default)]
    connection_id: String,
    #[serde(rename = "Data", default)]
    data: Option<serde_bytes::ByteBuf>,
}

impl TryFrom<WireMessage> for Message {
    type Error = MuxError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        Ok(Message {
            meta: Meta::try_from(wire.meta)?,
            other_client: wire.other_client,
            connection_id: wire.connection_id,
            data: wire
                .data
                .map(|buf| Bytes::from(buf.into_vec()))
                .unwrap_or_default(),
        })
    }
}
