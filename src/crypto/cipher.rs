//! Shared-Key Cipher
//!
//! ChaCha20-Poly1305 encryption under the chat's single shared key.
//! Every call to [`Cipher::encrypt`] produces a self-contained frame
//! (`nonce || ciphertext || tag`) that can be decrypted on its own.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use thiserror::Error;

/// Length of the shared key in bytes
pub const KEY_LEN: usize = 32;

/// Nonce size for ChaCha20-Poly1305
pub const NONCE_LEN: usize = 12;

/// Poly1305 authentication tag size
pub const TAG_LEN: usize = 16;

/// Bytes a sealed frame adds on top of its plaintext
pub const SEALED_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Errors that can occur during cipher operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// The frame was not produced under this key (tampered, wrong key, or not ciphertext at all)
    #[error("Authentication failure")]
    AuthenticationFailure,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Invalid key encoding: {0}")]
    InvalidKey(String),
}

/// The symmetric secret shared by the server and all of its clients
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; KEY_LEN]);

impl SharedKey {
    /// Generate a fresh random key from the OS RNG
    pub fn generate() -> Self {
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(key.as_slice());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse the URL-safe base64 text form used in key files
    pub fn from_encoded(text: &str) -> Result<Self, CipherError> {
        let decoded = URL_SAFE
            .decode(text.trim())
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let bytes: [u8; KEY_LEN] = decoded.try_into().map_err(|v: Vec<u8>| {
            CipherError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, v.len()))
        })?;
        Ok(Self(bytes))
    }

    /// URL-safe base64 (padded) text form, 44 characters
    pub fn encoded(&self) -> String {
        URL_SAFE.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// Stateless encrypt/decrypt under one [`SharedKey`]
#[derive(Clone)]
pub struct Cipher {
    aead: ChaCha20Poly1305,
}

impl Cipher {
    pub fn new(key: &SharedKey) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key.as_bytes())),
        }
    }

    /// Encrypt a payload into a standalone frame with a fresh nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .aead
            .encrypt(&nonce, plaintext)
            .map_err(|_| CipherError::EncryptionFailed)?;

        let mut frame = Vec::with_capacity(NONCE_LEN + sealed.len());
        frame.extend_from_slice(nonce.as_slice());
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Decrypt a frame produced by [`Cipher::encrypt`]
    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, CipherError> {
        if frame.len() < SEALED_OVERHEAD {
            return Err(CipherError::AuthenticationFailure);
        }
        let (nonce, sealed) = frame.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::AuthenticationFailure)
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cipher(..)")
    }
}

/// Encrypt `plaintext` under `key`
pub fn encrypt(key: &SharedKey, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    Cipher::new(key).encrypt(plaintext)
}

/// Decrypt `frame` under `key`
pub fn decrypt(key: &SharedKey, frame: &[u8]) -> Result<Vec<u8>, CipherError> {
    Cipher::new(key).decrypt(frame)
}
