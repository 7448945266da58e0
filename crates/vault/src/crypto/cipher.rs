//! AES-256-GCM sealing and opening of credential payloads and wrapped keys.
//!
//! Every call to [`seal`] draws a fresh 96-bit nonce from the OS CSPRNG, so a
//! nonce is never reused under the same key. The 16-byte authentication tag is
//! kept separate from the ciphertext so storage can record it as its own field.
//!
//! **Never reuse a nonce with the same key.** GCM nonce reuse breaks both
//! confidentiality and authentication.

use aes_gcm::{
    aead::{generic_array::GenericArray, rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    Aes256Gcm,
};
use thiserror::Error;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of an AES-GCM authentication tag.
pub const TAG_LEN: usize = 16;

/// Output of [`seal`]: nonce, ciphertext, and tag as separate parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl Sealed {
    /// Encode as `nonce || ciphertext || tag`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Parse the `nonce || ciphertext || tag` encoding produced by [`Sealed::to_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidFormat`] if `bytes` is too short to hold a
    /// nonce and tag.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::InvalidFormat);
        }
        let (nonce, rest) = bytes.split_at(NONCE_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

        let mut n = [0u8; NONCE_LEN];
        n.copy_from_slice(nonce);
        let mut t = [0u8; TAG_LEN];
        t.copy_from_slice(tag);

        Ok(Self {
            nonce: n,
            ciphertext: ciphertext.to_vec(),
            tag: t,
        })
    }
}

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes")]
    InvalidKeyLength,

    /// Authentication failed: wrong key, wrong associated data, or tampered bytes.
    #[error("integrity check failed")]
    Integrity,

    /// AES-GCM encryption failed.
    #[error("aead encryption failed")]
    EncryptFailure,

    /// An encoded sealed value is truncated.
    #[error("invalid sealed value format")]
    InvalidFormat,
}

/// Encrypt `plaintext` under `key`, binding `aad` as associated data.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
/// Returns [`CipherError::EncryptFailure`] on an internal AEAD error (should be
/// unreachable with a valid key and nonce).
pub fn seal(plaintext: &[u8], key: &[u8], aad: &[u8]) -> Result<Sealed, CipherError> {
    let cipher = build_cipher(key)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut out = cipher
        .encrypt(
            GenericArray::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CipherError::EncryptFailure)?;

    // aes-gcm appends the tag to the ciphertext.
    let tag_bytes = out.split_off(out.len() - TAG_LEN);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&tag_bytes);

    Ok(Sealed {
        nonce,
        ciphertext: out,
        tag,
    })
}

/// Decrypt a [`Sealed`] value, verifying its tag against `key` and `aad`.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
/// Returns [`CipherError::Integrity`] if authentication fails; no plaintext is
/// ever returned in that case.
pub fn open(sealed: &Sealed, key: &[u8], aad: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;

    let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(&sealed.ciphertext);
    combined.extend_from_slice(&sealed.tag);

    cipher
        .decrypt(
            GenericArray::from_slice(&sealed.nonce),
            Payload {
                msg: &combined,
                aad,
            },
        )
        .map_err(|_| CipherError::Integrity)
}

fn build_cipher(key: &[u8]) -> Result<Aes256Gcm, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength);
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)
}
