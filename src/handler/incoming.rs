//! The accept handle given to protocol handlers.
//!
//! An [`Incoming`] represents one peer request to open a stream. It must be
//! settled exactly once:
//! - [`Incoming::accept`] registers the stream, sends `ConnAck`, and returns
//!   the established [`Stream`]
//! - [`Incoming::reject`] answers `UnknownProto`
//!
//! Both consume the handle, so settling twice does not compile. Dropping it
//! unsettled is a bug in the handler: it is logged at error level and the
//! peer receives `UnknownProto` so its `open_stream` does not hang.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::{MuxError, Result};
use crate::protocol::{Message, Meta};
use crate::session::SessionInner;
use crate::stream::Stream;

/// Pending stream request from the peer.
pub struct Incoming {
    session: Weak<SessionInner>,
    connection_id: String,
    other_client: String,
    protocol: String,
    settled: bool,
}

impl Incoming {
    pub(crate) fn new(
        session: Weak<SessionInner>,
        connection_id: String,
        other_client: String,
        protocol: String,
    ) -> Self {
        Self {
            session,
            connection_id,
            other_client,
            protocol,
            settled: false,
        }
    }

    /// A request whose session no longer exists.
    #[cfg(test)]
    pub(crate) fn detached(connection_id: &str, other_client: &str, protocol: &str) -> Self {
        Self::new(
            Weak::new(),
            connection_id.to_string(),
            other_client.to_string(),
            protocol.to_string(),
        )
    }

    /// Connection id chosen by the peer.
    #[inline]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Name of the requesting peer.
    #[inline]
    pub fn other_client(&self) -> &str {
        &self.other_client
    }

    /// Requested protocol.
    #[inline]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Accept the request.
    ///
    /// The stream is in the session's table and `ConnAck` is queued before
    /// this returns, so the peer sees the acknowledgement ahead of any payload
    /// written to the returned stream.
    ///
    /// # Errors
    ///
    /// - [`MuxError::SessionClosed`] if the session is gone
    /// - [`MuxError::Protocol`] if the connection id is already in use
    /// - transport errors from sending `ConnAck`
    pub async fn accept(mut self) -> Result<Stream> {
        self.settled = true;
        let session = self.session()?;
        session
            .accept_stream(&self.connection_id, &self.other_client, &self.protocol)
            .await
    }

    /// Decline the request; the peer's `open_stream` fails with
    /// [`MuxError::UnknownProtocol`].
    pub async fn reject(mut self) -> Result<()> {
        self.settled = true;
        let session = self.session()?;
        tracing::debug!(
            "Rejecting stream {} for protocol {}",
            self.connection_id,
            self.protocol
        );
        session.send(self.rejection()).await
    }

    fn rejection(&self) -> Message {
        Message::control(
            Meta::UnknownProto,
            self.connection_id.as_str(),
            self.protocol.clone(),
        )
    }

    fn session(&self) -> Result<Arc<SessionInner>> {
        self.session.upgrade().ok_or(MuxError::SessionClosed)
    }
}

impl Drop for Incoming {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::error!(
            "Stream request {} for protocol {} dropped without accept or reject",
            self.connection_id,
            self.protocol
        );
        if let Some(session) = self.session.upgrade() {
            if let Err(e) = session.try_send(self.rejection()) {
                tracing::warn!("Failed to reject abandoned stream request: {}", e);
            }
        }
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming")
            .field("connection_id", &self.connection_id)
            .field("other_client", &self.other_client)
            .field("protocol", &self.protocol)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let incoming = Incoming::detached("bob:3", "bob", "echo");
        assert_eq!(incoming.connection_id(), "bob:3");
        assert_eq!(incoming.other_client(), "bob");
        assert_eq!(incoming.protocol(), "echo");
    }

    #[tokio::test]
    async fn test_settle_without_session() {
        let incoming = Incoming::detached("bob:4", "bob", "echo");
        assert!(matches!(incoming.accept().await, Err(MuxError::SessionClosed)));

        let incoming = Incoming::detached("bob:5", "bob", "echo");
        assert!(matches!(incoming.reject().await, Err(MuxError::SessionClosed)));
    }

    #[test]
    fn test_drop_unsettled_without_session_does_not_panic() {
        drop(Incoming::detached("bob:6", "bob", "echo"));
    }

    #[test]
    fn test_rejection_names_protocol() {
        let incoming = Incoming::detached("bob:7", "bob", "chat");
        let msg = incoming.rejection();
        assert_eq!(msg.meta, Meta::UnknownProto);
        assert_eq!(msg.connection_id, "bob:7");
        assert_eq!(&msg.data[..], b"chat");
        drop(incoming);
    }
}
