//! Challenge/response over a shared secret.
//!
//! A token is `nonce (32) || SHA-256(nonce || secret || context) (32)`. Tokens
//! are not secret themselves; forging one requires the secret.
//!
//! Two directions are used on the wire:
//! - [`Handshaker::respond`] (read-then-write): read the peer's token, verify it
//!   with an empty context, answer with a fresh token whose context is the token
//!   just read.
//! - [`Handshaker::challenge`] (write-then-read): send a token with an empty
//!   context, read the answer, verify it was computed over the token sent.
//!
//! A failed or timed-out handshake leaves the stream in an unknown state; callers
//! must drop the connection.

use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time,
};

pub const NONCE_LEN: usize = 32;
pub const TOKEN_LEN: usize = 64;

pub type Token = [u8; TOKEN_LEN];

/// Stand-in secret for an empty key, so an unconfigured key still yields a
/// deterministic, working handshake.
const EMPTY_SECRET_PLACEHOLDER: &[u8] = &[0u8];

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out")]
    Timeout,
    #[error("handshake not match")]
    Mismatch,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct Handshaker {
    secret: Vec<u8>,
}

impl std::fmt::Debug for Handshaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshaker").finish_non_exhaustive()
    }
}

impl Handshaker {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        let secret = secret.as_ref();
        let secret = if secret.is_empty() {
            EMPTY_SECRET_PLACEHOLDER.to_vec()
        } else {
            secret.to_vec()
        };
        Self { secret }
    }

    pub fn produce(&self, context: &[u8]) -> Token {
        let nonce: [u8; NONCE_LEN] = rand::random();
        let digest = self.digest(&nonce, context);

        let mut token = [0u8; TOKEN_LEN];
        token[..NONCE_LEN].copy_from_slice(&nonce);
        token[NONCE_LEN..].copy_from_slice(&digest);
        token
    }

    pub fn verify(&self, token: &Token, context: &[u8]) -> bool {
        let (nonce, digest) = token.split_at(NONCE_LEN);
        let expected = self.digest(nonce, context);
        digest_eq(digest, &expected)
    }

    fn digest(&self, nonce: &[u8], context: &[u8]) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(nonce);
        h.update(&self.secret);
        h.update(context);
        h.finalize().into()
    }

    /// Read-then-write side.
    ///
    /// `first_read` bounds the wait for the peer's token (`None` waits forever,
    /// used by pooled connections that idle until a public client shows up);
    /// `io_timeout` bounds the reply.
    pub async fn respond<S>(
        &self,
        stream: &mut S,
        first_read: Option<Duration>,
        io_timeout: Duration,
    ) -> Result<(), HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut theirs = [0u8; TOKEN_LEN];
        match first_read {
            Some(t) => bounded(t, stream.read_exact(&mut theirs)).await??,
            None => stream.read_exact(&mut theirs).await?,
        };

        if !self.verify(&theirs, &[]) {
            return Err(HandshakeError::Mismatch);
        }

        let ours = self.produce(&theirs);
        bounded(io_timeout, async {
            stream.write_all(&ours).await?;
            stream.flush().await
        })
        .await??;
        Ok(())
    }

    /// Write-then-read side.
    pub async fn challenge<S>(&self, stream: &mut S, io_timeout: Duration) -> Result<(), HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ours = self.produce(&[]);
        bounded(io_timeout, async {
            stream.write_all(&ours).await?;
            stream.flush().await
        })
        .await??;

        let mut theirs = [0u8; TOKEN_LEN];
        bounded(io_timeout, stream.read_exact(&mut theirs)).await??;

        if !self.verify(&theirs, &ours) {
            return Err(HandshakeError::Mismatch);
        }
        Ok(())
    }
}

async fn bounded<F, T>(timeout: Duration, fut: F) -> Result<T, HandshakeError>
where
    F: std::future::Future<Output = T>,
{
    if timeout.is_zero() {
        return Ok(fut.await);
    }
    time::timeout(timeout, fut)
        .await
        .map_err(|_| HandshakeError::Timeout)
}

// Equal-length comparison without early exit.
fn digest_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
