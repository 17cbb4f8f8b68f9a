//! Credential verification for the acceptor side of the auth handshake.
//!
//! A session configured with an [`Authenticator`] answers `Auth` messages by
//! calling [`Authenticator::verify`] with the peer's name and credential
//! bytes. `Ok(())` authenticates the session; `Err(reason)` is sent back to
//! the peer as the `AuthFailure` reason.
//!
//! Closures work directly:
//!
//! ```ignore
//! let session = SessionBuilder::new("server")
//!     .authenticator(|peer: String, credential: Bytes| async move {
//!         if credential == "letmein" { Ok(()) } else { Err(format!("bad password for {}", peer)) }
//!     })
//!     .start(transport);
//! ```

use std::future::Future;

use bytes::Bytes;

use crate::handler::BoxFuture;

/// Outcome of a credential check; the error is the reason shown to the peer.
pub type VerifyResult = std::result::Result<(), String>;

/// Judges the credentials carried by an `Auth` message.
pub trait Authenticator: Send + Sync + 'static {
    /// Accept or reject `credential` presented by `peer`.
    ///
    /// The future is awaited on the session's dispatch loop, so no other
    /// inbound message is handled until it resolves. Before authentication
    /// nothing else is accepted anyway. A local close abandons the check.
    fn verify(&self, peer: &str, credential: &Bytes) -> BoxFuture<'static, VerifyResult>;
}

impl<F, Fut> Authenticator for F
where
    F: Fn(String, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = VerifyResult> + Send + 'static,
{
    fn verify(&self, peer: &str, credential: &Bytes) -> BoxFuture<'static, VerifyResult> {
        Box::pin((self)(peer.to_string(), credential.clone()))
    }
}

/// Accepts exactly one fixed credential from any peer.
#[derive(Clone)]
pub struct SharedSecret {
    secret: Bytes,
}

impl SharedSecret {
    /// Create a verifier for the given secret.
    pub fn new(secret: impl Into<Bytes>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Compare without short-circuiting on the first differing byte.
    fn matches(&self, candidate: &[u8]) -> bool {
        candidate.len() == self.secret.len()
            && candidate
                .iter()
                .zip(self.secret.iter())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

impl Authenticator for SharedSecret {
    fn verify(&self, peer: &str, credential: &Bytes) -> BoxFuture<'static, VerifyResult> {
        let result = if self.matches(credential) {
            Ok(())
        } else {
            Err(format!("invalid credentials for {}", peer))
        };
        Box::pin(async move { result })
    }
}
