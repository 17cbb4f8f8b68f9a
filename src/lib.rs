//! # muxwire
//!
//! Many ordered logical streams over one reliable duplex byte stream.
//!
//! Two peers each wrap their end of a transport (TCP, a Unix socket, an
//! in-memory pipe) in a [`Session`]. After an authentication handshake either
//! side can open [`Stream`]s by protocol name; the other side routes each
//! request to the handler registered for that protocol.
//!
//! ## Architecture
//!
//! - **Dispatch loop**: the single reader; routes payload to per-stream queues
//!   and handles control messages
//! - **Writer task**: the single writer; every outbound message is one
//!   uninterrupted frame
//! - **Codec**: MsgPack (length-prefixed) or newline-delimited JSON, fixed per
//!   session
//!
//! ## Example
//!
//! ```ignore
//! use muxwire::{SessionBuilder, SharedSecret};
//!
//! #[tokio::main]
//! async fn main() -> muxwire::Result<()> {
//!     let (a, b) = tokio::io::duplex(64 * 1024);
//!
//!     let _server = SessionBuilder::new("server")
//!         .authenticator(SharedSecret::new("secret"))
//!         .route("echo", |stream| async move {
//!             while let Ok(chunk) = stream.read_message().await {
//!                 stream.write_message(chunk).await?;
//!             }
//!             Ok(())
//!         })
//!         .start(b);
//!
//!     let client = SessionBuilder::new("client").start(a);
//!     client.authenticate("secret").await?;
//!
//!     let stream = client.open_stream("echo").await?;
//!     stream.write_message("ping").await?;
//!     assert_eq!(stream.read_message().await?, "ping");
//!
//!     client.close().await
//! }
//! ```

pub mod auth;
pub mod codec;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod transport;
pub mod writer;

pub use auth::{Authenticator, SharedSecret};
pub use codec::CodecKind;
pub use error::{MuxError, Result};
pub use handler::{Incoming, ProtocolRouter};
pub use session::{Session, SessionBuilder, SessionConfig};
pub use stream::{Stream, StreamIo, StreamState};
