//! Session: one transport, many streams.
//!
//! A [`Session`] owns a reliable duplex byte stream and multiplexes any number
//! of [`Stream`]s over it. It runs two tasks:
//!
//! - the dispatch loop, sole reader of the transport, which routes payload to
//!   streams and answers control messages
//! - the writer task, sole writer of the transport
//!
//! Before any stream can be opened the session must be authenticated: the
//! initiator calls [`Session::authenticate`], the acceptor's
//! [`Authenticator`] judges the credential.
//!
//! # Example
//!
//! ```ignore
//! use muxwire::{SessionBuilder, SharedSecret};
//!
//! let server = SessionBuilder::new("server")
//!     .authenticator(SharedSecret::new("secret"))
//!     .route("echo", |stream| async move {
//!         while let Ok(chunk) = stream.read_message().await {
//!             stream.write_message(chunk).await?;
//!         }
//!         Ok(())
//!     })
//!     .start(server_transport);
//!
//! let client = SessionBuilder::new("client").start(client_transport);
//! client.authenticate("secret").await?;
//! let stream = client.open_stream("echo").await?;
//! stream.write_message("ping").await?;
//! assert_eq!(stream.read_message().await?, "ping");
//! ```

mod dispatch;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::auth::Authenticator;
use crate::codec::{Codec, CodecKind, MessageReader};
use crate::error::{MuxError, Result};
use crate::handler::{HandlerResult, Incoming, ProtocolRouter};
use crate::protocol::{Message, Meta, DEFAULT_MAX_FRAME_SIZE};
use crate::stream::{Establishment, Stream, DEFAULT_STREAM_QUEUE_CAPACITY};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Lock a std mutex, ignoring poisoning.
///
/// Critical sections here never leave shared state half-updated, so a panic
/// elsewhere does not invalidate the data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wire encoding; both peers must use the same one.
    pub codec: CodecKind,
    /// Largest frame accepted or produced.
    pub max_frame_size: usize,
    /// Inbound chunks buffered per stream before the dispatch loop waits.
    pub stream_queue_capacity: usize,
    /// Writer task settings.
    pub writer: WriterConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            codec: CodecKind::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            stream_queue_capacity: DEFAULT_STREAM_QUEUE_CAPACITY,
            writer: WriterConfig::default(),
        }
    }
}

/// Builder for creating a [`Session`].
///
/// # Example
///
/// ```ignore
/// let session = SessionBuilder::new("worker")
///     .codec(CodecKind::Json)
///     .stream_queue_capacity(16)
///     .route("echo", echo_handler)
///     .start(transport);
/// ```
pub struct SessionBuilder {
    name: String,
    config: SessionConfig,
    custom_codec: Option<Arc<dyn Codec>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    router: ProtocolRouter,
}

impl SessionBuilder {
    /// Create a builder; `name` identifies this side to the peer.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: SessionConfig::default(),
            custom_codec: None,
            authenticator: None,
            router: ProtocolRouter::new(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Select a built-in codec.
    pub fn codec(mut self, codec: CodecKind) -> Self {
        self.config.codec = codec;
        self
    }

    /// Use a codec implementation of your own instead of a built-in one.
    pub fn custom_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.custom_codec = Some(codec);
        self
    }

    /// Set the maximum frame size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the per-stream inbound queue capacity.
    pub fn stream_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.stream_queue_capacity = capacity;
        self
    }

    /// Set the writer channel capacity.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set how long a closing session may spend flushing the transport.
    ///
    /// Covers both a write already in progress and the queued remainder.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.shutdown_timeout = timeout;
        self
    }

    /// Verify `Auth` requests from the peer with `authenticator`.
    ///
    /// Without one, every `Auth` request is answered with `Wat`.
    pub fn authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Register a raw handler for `protocol`; see [`ProtocolRouter::handle`].
    pub fn handle<F, Fut>(mut self, protocol: impl Into<String>, handler: F) -> Self
    where
        F: Fn(String, Incoming) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.router.handle(protocol, handler);
        self
    }

    /// Register an auto-accepting handler for `protocol`; see
    /// [`ProtocolRouter::route`].
    pub fn route<F, Fut>(mut self, protocol: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.router.route(protocol, handler);
        self
    }

    /// Use a prepared router, replacing any routes registered so far.
    pub fn router(mut self, router: ProtocolRouter) -> Self {
        self.router = router;
        self
    }

    /// Take ownership of `transport` and start the session's tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<T>(self, transport: T) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = self
            .custom_codec
            .unwrap_or_else(|| self.config.codec.build(self.config.max_frame_size));
        let (read_half, write_half) = tokio::io::split(transport);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (writer, writer_task) =
            spawn_writer_task(write_half, self.config.writer.clone(), shutdown_rx);

        tracing::debug!("Starting session {} with {} codec", self.name, codec.name());

        let inner = Arc::new_cyclic(|me| SessionInner {
            me: me.clone(),
            name: self.name,
            codec: Arc::clone(&codec),
            writer,
            streams: Mutex::new(StreamTable::default()),
            next_connection: AtomicU32::new(0),
            authenticated: AtomicBool::new(false),
            peer_name: Mutex::new(None),
            pending_auth: Mutex::new(None),
            authenticator: self.authenticator,
            router: self.router,
            stream_queue_capacity: self.config.stream_queue_capacity,
            shutdown,
            dispatch_task: Mutex::new(None),
        });

        // A dead writer means nothing more can be said to the peer
        let watcher = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let result = match writer_task.await {
                Ok(result) => result,
                Err(e) => Err(MuxError::Protocol(format!("writer task failed: {}", e))),
            };
            if let Err(e) = result {
                tracing::error!("Writer error: {}", e);
            }
            if let Some(inner) = watcher.upgrade() {
                inner.teardown();
            }
        });

        let reader = MessageReader::new(read_half, codec);
        let task = tokio::spawn(dispatch::run(Arc::clone(&inner), reader));
        *lock(&inner.dispatch_task) = Some(task);

        Session { inner }
    }
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Shorthand for [`SessionBuilder::new`].
    pub fn builder(name: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(name)
    }

    /// Local name, stamped on every outbound message.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Peer name learned during authentication.
    pub fn peer_name(&self) -> Option<String> {
        self.inner.peer_name()
    }

    /// True once either side of the auth handshake succeeded.
    pub fn is_authenticated(&self) -> bool {
        self.inner.is_authenticated()
    }

    /// True once the session has been torn down.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Look up a live stream by connection id.
    pub fn stream(&self, connection_id: &str) -> Option<Stream> {
        self.inner.stream(connection_id)
    }

    /// Number of streams currently in the table (pending or established).
    pub fn stream_count(&self) -> usize {
        lock(&self.inner.streams).map.len()
    }

    /// Authenticate to the peer with `credential`.
    ///
    /// Waits for the peer's verdict. A rejection leaves the session
    /// unauthenticated and usable for another attempt.
    ///
    /// # Errors
    ///
    /// - [`MuxError::AlreadyAuthenticated`] if the session is authenticated
    /// - [`MuxError::Protocol`] if another attempt is in flight, or the peer
    ///   answered `Wat` (it has no verifier)
    /// - [`MuxError::AuthRejected`] with the peer's reason
    /// - [`MuxError::SessionClosed`] if the session closes while waiting
    pub async fn authenticate(&self, credential: impl Into<Bytes>) -> Result<()> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        if inner.is_authenticated() {
            return Err(MuxError::AlreadyAuthenticated);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&inner.pending_auth);
            if pending.as_ref().is_some_and(|tx| !tx.is_closed()) {
                return Err(MuxError::Protocol(
                    "authentication already in progress".to_string(),
                ));
            }
            *pending = Some(tx);
        }

        // Teardown may have drained pending_auth before we stored ours
        if inner.is_closed() {
            lock(&inner.pending_auth).take();
            return Err(MuxError::SessionClosed);
        }

        if let Err(e) = inner
            .send(Message::control(Meta::Auth, "", credential))
            .await
        {
            lock(&inner.pending_auth).take();
            return Err(e);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(MuxError::SessionClosed),
        }
    }

    /// Open a stream speaking `protocol` on the peer.
    ///
    /// Resolves once the peer accepted the stream.
    ///
    /// # Errors
    ///
    /// - [`MuxError::NotAuthenticated`] before authentication
    /// - [`MuxError::UnknownProtocol`] if the peer has no handler
    /// - [`MuxError::EndOfStream`] if the request was closed before an answer
    /// - [`MuxError::SessionClosed`] if the session closes while waiting
    pub async fn open_stream(&self, protocol: &str) -> Result<Stream> {
        let inner = &self.inner;
        if !inner.is_authenticated() {
            return Err(MuxError::NotAuthenticated);
        }

        let (stream, established) = inner.register_pending(protocol)?;
        tracing::debug!(
            "Opening stream {} for protocol {}",
            stream.connection_id(),
            protocol
        );

        let syn = Message::control(Meta::ConnSyn, stream.connection_id(), protocol.to_string());
        if let Err(e) = inner.send(syn).await {
            inner.remove_stream(stream.connection_id());
            stream.close_notify();
            return Err(e);
        }

        match established.await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => Err(e),
            Err(_) if inner.is_closed() => Err(MuxError::SessionClosed),
            Err(_) => Err(MuxError::EndOfStream),
        }
    }

    /// Close the session.
    ///
    /// Tells the peer (`ClientClosed`, best effort), closes every stream so
    /// blocked readers see end-of-stream, stops the dispatch loop, and flushes
    /// and shuts down the transport's write half.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Ok(());
        }

        // Never wait for queue space here: a stalled peer must not block close
        let bye = Message::control(Meta::ClientClosed, "", Bytes::new());
        if let Err(e) = inner.try_send(bye) {
            tracing::debug!("Could not announce close to peer: {}", e);
        }

        inner.teardown();
        Ok(())
    }

    /// Wait until the dispatch loop ends, returning its result.
    ///
    /// The loop ends cleanly when the peer closes the transport or
    /// [`close`](Self::close) is called, and with an error on transport
    /// failure or an undecodable frame. Only the first caller receives the
    /// loop's result; others wait for teardown and get `Ok(())`.
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        let task = lock(&self.inner.dispatch_task).take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| MuxError::Protocol(format!("dispatch task failed: {}", e)))?,
            None => {
                let mut shutdown = self.inner.shutdown.subscribe();
                let _ = shutdown.wait_for(|closed| *closed).await;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.name)
            .field("codec", &self.inner.codec.name())
            .field("authenticated", &self.is_authenticated())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Streams keyed by connection id.
#[derive(Default)]
pub(crate) struct StreamTable {
    map: HashMap<String, Stream>,
    /// Set by teardown; no stream may be added afterwards.
    closed: bool,
}

/// State shared by the session handle, its tasks, and its streams.
pub(crate) struct SessionInner {
    me: Weak<SessionInner>,
    name: String,
    codec: Arc<dyn Codec>,
    writer: WriterHandle,
    streams: Mutex<StreamTable>,
    next_connection: AtomicU32,
    authenticated: AtomicBool,
    peer_name: Mutex<Option<String>>,
    pending_auth: Mutex<Option<oneshot::Sender<Result<()>>>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    router: ProtocolRouter,
    stream_queue_capacity: usize,
    shutdown: watch::Sender<bool>,
    dispatch_task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl SessionInner {
    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn peer_name(&self) -> Option<String> {
        lock(&self.peer_name).clone()
    }

    fn set_authenticated(&self, peer: &str) {
        *lock(&self.peer_name) = Some(peer.to_string());
        self.authenticated.store(true, Ordering::Release);
    }

    pub(crate) fn stream(&self, connection_id: &str) -> Option<Stream> {
        lock(&self.streams).map.get(connection_id).cloned()
    }

    pub(crate) fn remove_stream(&self, connection_id: &str) -> Option<Stream> {
        lock(&self.streams).map.remove(connection_id)
    }

    /// Encode with our name stamped in `other_client`.
    fn encode(&self, mut message: Message) -> Result<OutboundFrame> {
        message.other_client.clone_from(&self.name);
        let mut buf = BytesMut::new();
        self.codec.encode(&message, &mut buf)?;
        Ok(OutboundFrame::new(buf.freeze()))
    }

    /// Queue a message on the writer.
    pub(crate) async fn send(&self, message: Message) -> Result<()> {
        let frame = self.encode(message)?;
        self.writer.send(frame).await
    }

    /// Queue a message without waiting; for `Drop` paths.
    pub(crate) fn try_send(&self, message: Message) -> Result<()> {
        let frame = self.encode(message)?;
        self.writer.try_send(frame)
    }

    /// Create a pending stream under a fresh connection id.
    fn register_pending(&self, protocol: &str) -> Result<(Stream, Establishment)> {
        let mut table = lock(&self.streams);
        if table.closed {
            return Err(MuxError::SessionClosed);
        }

        let connection_id = loop {
            let n = self.next_connection.fetch_add(1, Ordering::Relaxed);
            let id = format!("{}:{:x}", self.name, n);
            if !table.map.contains_key(&id) {
                break id;
            }
        };

        let peer = self.peer_name().unwrap_or_default();
        let (stream, established) = Stream::pending(
            &connection_id,
            &peer,
            protocol,
            self.stream_queue_capacity,
            self.me.clone(),
        );
        table.map.insert(connection_id, stream.clone());
        Ok((stream, established))
    }

    /// Register an accepted stream and acknowledge it.
    pub(crate) async fn accept_stream(
        &self,
        connection_id: &str,
        other_client: &str,
        protocol: &str,
    ) -> Result<Stream> {
        let stream = Stream::established(
            connection_id,
            other_client,
            protocol,
            self.stream_queue_capacity,
            self.me.clone(),
        );

        {
            let mut table = lock(&self.streams);
            if table.closed {
                return Err(MuxError::SessionClosed);
            }
            if table.map.contains_key(connection_id) {
                return Err(MuxError::Protocol(format!(
                    "connection id {} already in use",
                    connection_id
                )));
            }
            table.map.insert(connection_id.to_string(), stream.clone());
        }

        let ack = Message::control(Meta::ConnAck, connection_id, Bytes::new());
        if let Err(e) = self.send(ack).await {
            self.remove_stream(connection_id);
            stream.close_notify();
            return Err(e);
        }

        tracing::debug!(
            "Accepted stream {} for protocol {} from {}",
            connection_id,
            protocol,
            other_client
        );
        Ok(stream)
    }

    /// Remove a locally closed stream and tell the peer.
    ///
    /// Nothing is sent if the stream was already gone from the table.
    pub(crate) async fn notify_closed(&self, stream: &Stream) -> Result<()> {
        if self.remove_stream(stream.connection_id()).is_none() {
            return Ok(());
        }

        let closed = Message::control(Meta::ConnClosed, stream.connection_id(), Bytes::new());
        match self.send(closed).await {
            Err(MuxError::ConnectionClosed) => Ok(()),
            other => other,
        }
    }

    /// Stop everything: signal shutdown, close every stream, fail waiters.
    pub(crate) fn teardown(&self) {
        if !self.shutdown.send_replace(true) {
            tracing::debug!("Session {} shutting down", self.name);
        }

        let streams = {
            let mut table = lock(&self.streams);
            table.closed = true;
            std::mem::take(&mut table.map)
        };

        drop(lock(&self.pending_auth).take());

        for stream in streams.into_values() {
            stream.close_notify();
        }
    }
}
