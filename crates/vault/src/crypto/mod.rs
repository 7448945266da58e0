//! AES-256-GCM primitives and key containers.
//!
//! This module is intentionally free of AWS, storage, and task dependencies.
//! It provides the low-level seal/open operations used by the KMS provider and
//! the credential store.
//!
//! # Stored layout
//!
//! Credential rows keep `nonce`, `ciphertext` and `tag` as separate fields.
//! Locally wrapped DEKs use the packed form:
//!
//! ```text
//! nonce (12 bytes) || ciphertext || tag (16 bytes)
//! ```

pub mod cipher;
pub mod key;

pub use cipher::{CipherError, Sealed, KEY_LEN};
pub use key::{DekBytes, SecretBytes};
