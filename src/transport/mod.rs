//! Transport module - sockets a session can run over.
//!
//! A session accepts any `AsyncRead + AsyncWrite` byte stream; these helpers
//! cover the common cases:
//! - TCP (all platforms)
//! - Unix Domain Sockets (Linux/macOS)

mod socket;

pub use socket::{dial_tcp, TcpAcceptor};

#[cfg(unix)]
pub use socket::{dial_unix, UnixAcceptor};
