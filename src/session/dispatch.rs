//! The dispatch loop: sole reader of the transport.
//!
//! Payload (`Meta::None`) goes to the addressed stream's queue; every other
//! kind is handled here. Until the session is authenticated only the
//! handshake kinds are processed and everything else is answered with `Wat`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncRead;

use super::{lock, SessionInner};
use crate::codec::MessageReader;
use crate::error::{MuxError, Result};
use crate::handler::Incoming;
use crate::protocol::{Message, Meta};
use crate::stream::Stream;

/// Read and dispatch until the transport ends or the session shuts down.
///
/// Tears the session down on the way out, whatever the reason.
pub(super) async fn run<R>(inner: Arc<SessionInner>, mut reader: MessageReader<R>) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut shutdown = inner.shutdown.subscribe();

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => break Ok(()),
            next = reader.read_message() => next,
        };

        match next {
            Ok(Some(message)) => {
                if let Err(e) = inner.dispatch(message).await {
                    break Err(e);
                }
            }
            Ok(None) => {
                tracing::debug!("Transport closed by peer of session {}", inner.name);
                break Ok(());
            }
            // Reads racing a local close are expected to fail
            Err(_) if inner.is_closed() => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = &result {
        tracing::error!("Read loop error: {}", e);
    }
    inner.teardown();
    result
}

impl SessionInner {
    /// Handle one inbound message.
    ///
    /// Errors are fatal to the session; they come only from failing to
    /// queue a reply.
    async fn dispatch(&self, message: Message) -> Result<()> {
        if !self.is_authenticated() && !message.meta.is_handshake() {
            tracing::warn!(
                "Ignoring {:?} from {} before authentication",
                message.meta,
                message.other_client
            );
            return self
                .reply(
                    Meta::Wat,
                    &message.connection_id,
                    MuxError::NotAuthenticated.to_string(),
                )
                .await;
        }

        match message.meta {
            Meta::None => self.on_payload(message).await,
            Meta::ConnSyn => self.on_conn_syn(message).await,
            Meta::ConnAck => self.on_conn_ack(message).await,
            Meta::UnknownProto => {
                self.on_unknown_proto(message);
                Ok(())
            }
            Meta::NoSuchConnection | Meta::ConnClosed => {
                if let Some(stream) = self.remove_stream(&message.connection_id) {
                    tracing::debug!(
                        "Stream {} closed by peer ({:?})",
                        message.connection_id,
                        message.meta
                    );
                    stream.close_notify();
                }
                Ok(())
            }
            Meta::ClientClosed => {
                self.on_client_closed(&message.other_client);
                Ok(())
            }
            Meta::Auth => self.on_auth(message).await,
            Meta::AuthOk | Meta::AuthFailure => self.on_auth_result(message).await,
            Meta::Wat => {
                self.on_wat(&message);
                Ok(())
            }
        }
    }

    async fn reply(&self, meta: Meta, connection_id: &str, data: impl Into<Bytes>) -> Result<()> {
        self.send(Message::control(meta, connection_id, data)).await
    }

    async fn on_payload(&self, message: Message) -> Result<()> {
        let connection_id = message.connection_id.clone();
        let delivered = match self.stream(&connection_id).filter(Stream::is_established) {
            Some(stream) => stream.put_message(message).await,
            None => false,
        };

        if !delivered {
            tracing::warn!("Payload for unknown stream {}", connection_id);
            return self
                .reply(Meta::NoSuchConnection, &connection_id, Bytes::new())
                .await;
        }
        Ok(())
    }

    async fn on_conn_syn(&self, message: Message) -> Result<()> {
        let protocol = message.data_text();
        let connection_id = message.connection_id;

        if self.stream(&connection_id).is_some() {
            tracing::warn!("Peer reused connection id {}", connection_id);
            return self
                .reply(Meta::Wat, &connection_id, "connection id already in use")
                .await;
        }

        let Some(handler) = self.router.get(&protocol) else {
            tracing::warn!("No handler for protocol {}", protocol);
            return self
                .reply(Meta::UnknownProto, &connection_id, protocol)
                .await;
        };

        tracing::debug!(
            "Stream {} requested for protocol {} by {}",
            connection_id,
            protocol,
            message.other_client
        );

        let incoming = Incoming::new(
            self.me.clone(),
            connection_id,
            message.other_client,
            protocol.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = handler.call(protocol.clone(), incoming).await {
                tracing::error!("Handler for protocol {} failed: {}", protocol, e);
            }
        });
        Ok(())
    }

    async fn on_conn_ack(&self, message: Message) -> Result<()> {
        match self.stream(&message.connection_id) {
            Some(stream) => {
                if stream.mark_established() {
                    tracing::debug!("Stream {} established", message.connection_id);
                } else {
                    tracing::warn!("Duplicate ConnAck for stream {}", message.connection_id);
                }
                Ok(())
            }
            None => {
                tracing::warn!("ConnAck for unknown stream {}", message.connection_id);
                self.reply(Meta::NoSuchConnection, &message.connection_id, Bytes::new())
                    .await
            }
        }
    }

    fn on_unknown_proto(&self, message: Message) {
        let Some(stream) = self.remove_stream(&message.connection_id) else {
            return;
        };

        let protocol = if message.data.is_empty() {
            stream.protocol().to_string()
        } else {
            message.data_text()
        };
        tracing::warn!("Peer has no handler for protocol {}", protocol);

        if !stream.is_established() {
            stream.fail_establishment(MuxError::UnknownProtocol(protocol));
        }
        stream.close_notify();
    }

    fn on_client_closed(&self, peer: &str) {
        let closed: Vec<Stream> = {
            let mut table = lock(&self.streams);
            let ids: Vec<String> = table
                .map
                .iter()
                .filter(|(_, stream)| stream.other_client() == peer)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| table.map.remove(id)).collect()
        };

        tracing::debug!("Peer {} closed; dropping {} streams", peer, closed.len());
        for stream in closed {
            stream.close_notify();
        }
    }

    async fn on_auth(&self, message: Message) -> Result<()> {
        if self.is_authenticated() {
            tracing::warn!("Repeated Auth from {}", message.other_client);
            return self
                .reply(
                    Meta::Wat,
                    "",
                    MuxError::AlreadyAuthenticated.to_string(),
                )
                .await;
        }

        let Some(authenticator) = self.authenticator.clone() else {
            tracing::warn!("Auth from {} but no authenticator configured", message.other_client);
            return self
                .reply(Meta::Wat, "", "authentication not supported")
                .await;
        };

        // Nothing but handshake traffic flows before authentication, so the
        // verifier only has to yield to a local shutdown.
        let mut shutdown = self.shutdown.subscribe();
        let verdict = tokio::select! {
            verdict = authenticator.verify(&message.other_client, &message.data) => verdict,
            _ = shutdown.wait_for(|closed| *closed) => return Ok(()),
        };

        match verdict {
            Ok(()) => {
                // AuthOk must be queued ahead of anything our own open_stream sends
                self.reply(Meta::AuthOk, "", Bytes::new()).await?;
                self.set_authenticated(&message.other_client);
                tracing::debug!("Peer {} authenticated", message.other_client);
                Ok(())
            }
            Err(reason) => {
                tracing::debug!("Peer {} failed authentication: {}", message.other_client, reason);
                self.reply(Meta::AuthFailure, "", reason).await
            }
        }
    }

    async fn on_auth_result(&self, message: Message) -> Result<()> {
        let pending = lock(&self.pending_auth).take();
        let Some(tx) = pending else {
            tracing::warn!("Unexpected {:?} from {}", message.meta, message.other_client);
            return self
                .reply(Meta::Wat, "", "no authentication in progress")
                .await;
        };

        let result = if message.meta == Meta::AuthOk {
            self.set_authenticated(&message.other_client);
            tracing::debug!("Authenticated to {}", message.other_client);
            Ok(())
        } else {
            let reason = message.data_text();
            tracing::debug!("Authentication rejected by {}: {}", message.other_client, reason);
            Err(MuxError::AuthRejected(reason))
        };

        // The caller may have given up waiting
        let _ = tx.send(result);
        Ok(())
    }

    fn on_wat(&self, message: &Message) {
        let reason = message.data_text();
        tracing::warn!(
            "Peer {} reported a protocol violation: {}",
            message.other_client,
            reason
        );

        if !message.connection_id.is_empty() {
            if let Some(stream) = self.remove_stream(&message.connection_id) {
                if !stream.is_established() {
                    stream.fail_establishment(MuxError::Protocol(format!(
                        "peer refused stream {}: {}",
                        message.connection_id, reason
                    )));
                }
                stream.close_notify();
            }
            return;
        }

        if let Some(tx) = lock(&self.pending_auth).take() {
            let _ = tx.send(Err(MuxError::Protocol(format!(
                "peer refused authentication: {}",
                reason
            ))));
        }
    }
}
