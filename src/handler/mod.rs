//! Handler module - routing incoming stream requests.
//!
//! Provides:
//! - [`ProtocolRouter`] - maps protocol names to handlers
//! - [`Incoming`] - single-use accept handle given to handlers
//!
//! # Example
//!
//! ```ignore
//! use muxwire::handler::ProtocolRouter;
//!
//! let mut router = ProtocolRouter::new();
//!
//! router.route("echo", |stream| async move {
//!     while let Ok(chunk) = stream.read_message().await {
//!         stream.write_message(chunk).await?;
//!     }
//!     Ok(())
//! });
//! ```

mod incoming;
mod router;

pub use incoming::Incoming;
pub use router::{
    BoxFuture, FnHandler, HandlerResult, ProtocolHandler, ProtocolRouter, StreamHandler,
};
