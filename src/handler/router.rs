//! Protocol router: maps protocol names to handlers for incoming streams.
//!
//! Each `ConnSyn` that names a registered protocol invokes its handler exactly
//! once, on a task of its own. Handler errors are logged by the session and
//! never reach the dispatch loop.
//!
//! # Example
//!
//! ```ignore
//! use muxwire::handler::ProtocolRouter;
//!
//! let mut router = ProtocolRouter::new();
//!
//! // Raw form: decide per request
//! router.handle("admin", |_protocol, incoming| async move {
//!     if incoming.other_client() == "root" {
//!         let stream = incoming.accept().await?;
//!         stream.write_message("welcome").await
//!     } else {
//!         incoming.reject().await
//!     }
//! });
//!
//! // Routed form: the stream is accepted before the handler runs
//! router.route("echo", |stream| async move {
//!     while let Ok(chunk) = stream.read_message().await {
//!         stream.write_message(chunk).await?;
//!     }
//!     Ok(())
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use super::Incoming;
use crate::error::Result;
use crate::stream::Stream;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for protocol handlers.
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Handle one stream request for `protocol`.
    ///
    /// The handler must settle `incoming` by accepting or rejecting it.
    fn call(&self, protocol: String, incoming: Incoming) -> BoxFuture<'static, HandlerResult>;
}

/// Adapter for closures taking the raw `(protocol, Incoming)` pair.
pub struct FnHandler<F, Fut>
where
    F: Fn(String, Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(String, Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Wrap a closure.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> ProtocolHandler for FnHandler<F, Fut>
where
    F: Fn(String, Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, protocol: String, incoming: Incoming) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(protocol, incoming))
    }
}

/// Adapter that accepts every request and hands the stream to a closure.
pub struct StreamHandler<F, Fut>
where
    F: Fn(Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: Arc<F>,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> StreamHandler<F, Fut>
where
    F: Fn(Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Wrap a closure.
    pub fn new(handler: F) -> Self {
        Self {
            handler: Arc::new(handler),
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> ProtocolHandler for StreamHandler<F, Fut>
where
    F: Fn(Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, _protocol: String, incoming: Incoming) -> BoxFuture<'static, HandlerResult> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let stream = incoming.accept().await?;
            handler(stream).await
        })
    }
}

/// Registry mapping protocol names to handlers.
#[derive(Clone, Default)]
pub struct ProtocolRouter {
    routes: HashMap<String, Arc<dyn ProtocolHandler>>,
}

impl ProtocolRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler object. A later registration for the same protocol
    /// replaces the earlier one.
    pub fn register(&mut self, protocol: impl Into<String>, handler: impl ProtocolHandler) {
        let protocol = protocol.into();
        if self.routes.insert(protocol.clone(), Arc::new(handler)).is_some() {
            tracing::debug!("Replacing handler for protocol {}", protocol);
        }
    }

    /// Register a raw handler that decides whether to accept each request.
    pub fn handle<F, Fut>(&mut self, protocol: impl Into<String>, handler: F)
    where
        F: Fn(String, Incoming) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(protocol, FnHandler::new(handler));
    }

    /// Register a handler that receives already-accepted streams.
    pub fn route<F, Fut>(&mut self, protocol: impl Into<String>, handler: F)
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(protocol, StreamHandler::new(handler));
    }

    /// Look up the handler for a protocol.
    pub fn get(&self, protocol: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.routes.get(protocol).cloned()
    }

    /// True if a handler is registered for `protocol`.
    pub fn contains(&self, protocol: &str) -> bool {
        self.routes.contains_key(protocol)
    }

    /// Registered protocol names, in no particular order.
    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Number of registered protocols.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for ProtocolRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.routes.keys()).finish()
    }
}
