//! Socket helpers producing transports a session can own.
//!
//! - TCP: any platform
//! - Unix Domain Socket: Unix only
//!
//! # Example
//!
//! ```ignore
//! use muxwire::transport::TcpAcceptor;
//!
//! let acceptor = TcpAcceptor::bind("127.0.0.1:0").await?;
//! let (socket, peer) = acceptor.accept().await?;
//! let session = SessionBuilder::new("server").start(socket);
//! ```

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::error::Result;

// ============================================================================
// TCP
// ============================================================================

/// Connect to a TCP endpoint.
///
/// Nagle is disabled: control messages are small and latency-sensitive.
pub async fn dial_tcp(addr: impl ToSocketAddrs) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// TCP listener handing out one socket per peer.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    /// Bind to `addr`. Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use std::path::{Path, PathBuf};

    use tokio::net::{UnixListener, UnixStream};

    use crate::error::Result;

    /// Connect to a Unix domain socket.
    pub async fn dial_unix(path: impl AsRef<Path>) -> Result<UnixStream> {
        Ok(UnixStream::connect(path).await?)
    }

    /// Unix Domain Socket listener that owns its socket file.
    pub struct UnixAcceptor {
        listener: UnixListener,
        path: PathBuf,
    }

    impl UnixAcceptor {
        /// Bind to a Unix socket path.
        ///
        /// Removes any existing socket file at the path before binding.
        pub async fn bind(path: impl AsRef<Path>) -> Result<Self> {
            let path = path.as_ref();
            // Remove old socket if it exists
            if path.exists() {
                std::fs::remove_file(path)?;
            }

            let listener = UnixListener::bind(path)?;

            Ok(Self {
                listener,
                path: path.to_path_buf(),
            })
        }

        /// Accept a single connection.
        pub async fn accept(&self) -> Result<UnixStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(stream)
        }

        /// Get the socket path.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for UnixAcceptor {
        fn drop(&mut self) {
            // Clean up socket file when listener is dropped
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{dial_unix, UnixAcceptor};

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_dial_and_accept() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = dial_tcp(addr).await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let (mut server, _peer) = acceptor.accept().await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        client.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_acceptor_replaces_stale_file_and_cleans_up() {
        let path = std::env::temp_dir().join(format!("muxwire-test-{}.sock", std::process::id()));
        std::fs::write(&path, b"stale").unwrap();

        let acceptor = UnixAcceptor::bind(&path).await.unwrap();
        assert_eq!(acceptor.path(), path.as_path());

        let dial_path = path.clone();
        let client = tokio::spawn(async move {
            let mut stream = dial_unix(&dial_path).await.unwrap();
            stream.write_all(b"yo").await.unwrap();
        });

        let mut server = acceptor.accept().await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"yo");
        client.await.unwrap();

        drop(acceptor);
        assert!(!path.exists());
    }
}
