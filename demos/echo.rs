//! Echo over TCP - one server session, one client session.
//!
//! This example demonstrates:
//! - Accepting a TCP connection and wrapping it in a session
//! - Verifying credentials with a shared secret
//! - Routing a protocol to a handler that echoes every chunk
//! - Authenticating, opening a stream, and closing cleanly from the client
//!
//! # Running
//!
//! ```text
//! RUST_LOG=muxwire=debug cargo run --example echo
//! ```

use muxwire::transport::{dial_tcp, TcpAcceptor};
use muxwire::{SessionBuilder, SharedSecret, Stream};
use tracing_subscriber::EnvFilter;

async fn echo(stream: Stream) -> muxwire::Result<()> {
    while let Ok(chunk) = stream.read_message().await {
        stream.write_message(chunk).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let acceptor = TcpAcceptor::bind("127.0.0.1:0").await?;
    let addr = acceptor.local_addr()?;
    tracing::info!("Listening on {}", addr);

    let server = tokio::spawn(async move {
        let (socket, peer) = acceptor.accept().await?;
        tracing::info!("Accepted {}", peer);

        let session = SessionBuilder::new("server")
            .authenticator(SharedSecret::new("secret"))
            .route("echo", echo)
            .start(socket);

        // Runs until the client closes its side
        session.wait_for_shutdown().await
    });

    let client = SessionBuilder::new("client").start(dial_tcp(addr).await?);
    client.authenticate("secret").await?;

    let stream = client.open_stream("echo").await?;
    for word in ["ping", "hello", "bye"] {
        stream.write_message(word).await?;
        let reply = stream.read_message().await?;
        tracing::info!("Sent {:?}, got {:?}", word, String::from_utf8_lossy(&reply));
    }

    stream.close().await?;
    client.close().await?;
    server.await??;

    Ok(())
}
