//! Symmetric stream cipher for relayed bytes.
//!
//! Key material is the passphrase repeated to fill 32 bytes. This is a
//! convenience stretch, not a KDF: short passphrases give weak keys.
//!
//! The IV is derived from the key alone, so every session under one key starts
//! from the same keystream offset. Two captured sessions under the same key can
//! be XORed against each other. Treat this as link obfuscation against passive
//! observers, not as confidentiality against an active attacker.

use std::sync::{Mutex, PoisonError};

use chacha20::{
    ChaCha20, Key, Nonce,
    cipher::{KeyIvInit, StreamCipher},
};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;

const IV_SALT: &[u8] = b"lanbridge/chacha20/iv";

#[derive(Debug, Error)]
pub enum CryptorError {
    #[error("empty encryption key")]
    EmptyKey,
}

/// In-place, length-preserving transform applied by the relay engine.
///
/// `encrypt` and `decrypt` each advance their own keystream and may be called
/// concurrently from the two relay directions.
pub trait Cryptor: Send + Sync {
    fn encrypt(&self, buf: &mut [u8]);
    fn decrypt(&self, buf: &mut [u8]);
}

pub struct ChaCha20Cryptor {
    enc: Mutex<ChaCha20>,
    dec: Mutex<ChaCha20>,
}

impl std::fmt::Debug for ChaCha20Cryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaCha20Cryptor").finish_non_exhaustive()
    }
}

impl ChaCha20Cryptor {
    pub fn new(passphrase: &str) -> Result<Self, CryptorError> {
        let key = stretch_key(passphrase.as_bytes())?;
        let iv = derive_iv(&key);
        let cipher = || ChaCha20::new(Key::from_slice(&key), Nonce::from_slice(&iv));
        Ok(Self {
            enc: Mutex::new(cipher()),
            dec: Mutex::new(cipher()),
        })
    }
}

impl Cryptor for ChaCha20Cryptor {
    fn encrypt(&self, buf: &mut [u8]) {
        let mut c = self.enc.lock().unwrap_or_else(PoisonError::into_inner);
        c.apply_keystream(buf);
    }

    fn decrypt(&self, buf: &mut [u8]) {
        let mut c = self.dec.lock().unwrap_or_else(PoisonError::into_inner);
        c.apply_keystream(buf);
    }
}

/// Repeat `passphrase` until it fills the key.
pub fn stretch_key(passphrase: &[u8]) -> Result<[u8; KEY_SIZE], CryptorError> {
    if passphrase.is_empty() {
        return Err(CryptorError::EmptyKey);
    }
    let mut key = [0u8; KEY_SIZE];
    for (i, b) in key.iter_mut().enumerate() {
        *b = passphrase[i % passphrase.len()];
    }
    Ok(key)
}

fn derive_iv(key: &[u8; KEY_SIZE]) -> [u8; IV_SIZE] {
    let mut h = Sha256::new();
    h.update(IV_SALT);
    h.update(key);
    let d = h.finalize();
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&d[..IV_SIZE]);
    iv
}
