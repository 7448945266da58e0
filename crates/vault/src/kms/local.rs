//! In-process KMS for development and tests.
//!
//! Each tenant gets its own key-encryption key, derived as
//! `HMAC-SHA256(master, "tenant-vault/kek/" || tenant_id)`. DEKs are sealed with
//! AES-256-GCM under that key with `kms_key_id || "|" || tenant_id` as
//! associated data, so a wrapped DEK only unwraps for the tenant and master key
//! it was produced for.

use async_trait::async_trait;
use common::{TenantContext, TenantId};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{KmsError, KmsProvider, WrappedKey};
use crate::crypto::{cipher, DekBytes, SecretBytes, Sealed};

type HmacSha256 = Hmac<Sha256>;

const KEK_LABEL: &[u8] = b"tenant-vault/kek/";

/// Local KMS backed by a single master key held in memory.
pub struct LocalKms {
    key_id: String,
    master: DekBytes,
}

impl LocalKms {
    pub fn new(key_id: impl Into<String>, master: DekBytes) -> Self {
        Self {
            key_id: key_id.into(),
            master,
        }
    }

    fn tenant_kek(&self, tenant_id: &TenantId) -> Result<DekBytes, KmsError> {
        let mut mac = HmacSha256::new_from_slice(self.master.as_bytes())
            .map_err(|_| KmsError::InvalidResponse("master key rejected by HMAC"))?;
        mac.update(KEK_LABEL);
        mac.update(tenant_id.as_str().as_bytes());
        let derived = mac.finalize().into_bytes();
        DekBytes::from_slice(&derived).ok_or(KmsError::InvalidResponse("derived KEK length"))
    }

    fn aad(&self, tenant_id: &TenantId) -> Vec<u8> {
        format!("{}|{}", self.key_id, tenant_id).into_bytes()
    }
}

#[async_trait]
impl KmsProvider for LocalKms {
    fn key_id(&self) -> String {
        self.key_id.clone()
    }

    async fn wrap(
        &self,
        plaintext_key: &DekBytes,
        ctx: &TenantContext,
    ) -> Result<WrappedKey, KmsError> {
        let kek = self.tenant_kek(&ctx.tenant_id)?;
        let aad = self.aad(&ctx.tenant_id);
        let sealed = cipher::seal(plaintext_key.as_bytes(), kek.as_bytes(), &aad)
            .map_err(|e| KmsError::Unavailable(format!("local wrap failed: {e}")))?;
        Ok(WrappedKey {
            kms_key_id: self.key_id.clone(),
            ciphertext: sealed.to_bytes(),
        })
    }

    async fn unwrap(
        &self,
        wrapped: &WrappedKey,
        ctx: &TenantContext,
    ) -> Result<DekBytes, KmsError> {
        if wrapped.kms_key_id != self.key_id {
            return Err(KmsError::KeyNotFound(wrapped.kms_key_id.clone()));
        }
        let sealed = Sealed::from_bytes(&wrapped.ciphertext)
            .map_err(|_| KmsError::AccessDenied("malformed wrapped key".into()))?;
        let kek = self.tenant_kek(&ctx.tenant_id)?;
        let plaintext = cipher::open(&sealed, kek.as_bytes(), &self.aad(&ctx.tenant_id))
            .map(SecretBytes::new)
            .map_err(|_| KmsError::AccessDenied("wrapped key does not authenticate".into()))?;
        DekBytes::from_slice(plaintext.expose())
            .ok_or(KmsError::InvalidResponse("unwrapped key has unexpected length"))
    }
}
