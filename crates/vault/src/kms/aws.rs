//! AWS KMS backend.
//!
//! DEKs are wrapped with `Encrypt` and unwrapped with `Decrypt`, both carrying
//! the encryption context `{"tenant_id": <tenant>}` so a wrapped key can only
//! be unwrapped for the tenant it was produced for. The key policy may further
//! restrict callers per tenant via `kms:EncryptionContext:tenant_id`.

use async_trait::async_trait;
use aws_sdk_kms::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_kms::primitives::Blob;
use common::TenantContext;

use super::{KmsError, KmsProvider, WrappedKey};
use crate::crypto::DekBytes;

/// Encryption-context key binding wrapped DEKs to a tenant.
pub const TENANT_CONTEXT_KEY: &str = "tenant_id";

/// KMS backend calling AWS KMS.
pub struct AwsKms {
    client: aws_sdk_kms::Client,
    key_id: String,
}

impl AwsKms {
    pub fn new(client: aws_sdk_kms::Client, key_id: impl Into<String>) -> Self {
        Self {
            client,
            key_id: key_id.into(),
        }
    }
}

#[async_trait]
impl KmsProvider for AwsKms {
    fn key_id(&self) -> String {
        self.key_id.clone()
    }

    async fn wrap(
        &self,
        plaintext_key: &DekBytes,
        ctx: &TenantContext,
    ) -> Result<WrappedKey, KmsError> {
        let resp = self
            .client
            .encrypt()
            .key_id(&self.key_id)
            .plaintext(Blob::new(plaintext_key.as_bytes().to_vec()))
            .encryption_context(TENANT_CONTEXT_KEY, ctx.tenant_id.as_str())
            .send()
            .await
            .map_err(|e| classify(&e))?;

        let ciphertext = resp
            .ciphertext_blob()
            .ok_or(KmsError::InvalidResponse("encrypt response contained no ciphertext"))?;

        Ok(WrappedKey {
            // KMS reports the full key ARN; keep the configured reference so
            // later unwraps address the same key.
            kms_key_id: self.key_id.clone(),
            ciphertext: ciphertext.as_ref().to_vec(),
        })
    }

    async fn unwrap(
        &self,
        wrapped: &WrappedKey,
        ctx: &TenantContext,
    ) -> Result<DekBytes, KmsError> {
        let resp = self
            .client
            .decrypt()
            .key_id(&wrapped.kms_key_id)
            .ciphertext_blob(Blob::new(wrapped.ciphertext.clone()))
            .encryption_context(TENANT_CONTEXT_KEY, ctx.tenant_id.as_str())
            .send()
            .await
            .map_err(|e| classify(&e))?;

        let plaintext = resp
            .plaintext()
            .ok_or(KmsError::InvalidResponse("decrypt response contained no plaintext"))?;

        DekBytes::from_slice(plaintext.as_ref())
            .ok_or(KmsError::InvalidResponse("unwrapped key has unexpected length"))
    }
}

fn classify<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> KmsError {
    let code = err.as_service_error().and_then(|e| e.code());
    error_for_code(code)
}

/// Map an AWS KMS error code onto the vault's KMS error taxonomy.
///
/// `None` means the request never produced a service response (dispatch
/// failure, timeout, I/O), which is always retryable.
pub fn error_for_code(code: Option<&str>) -> KmsError {
    match code {
        Some(
            c @ ("AccessDeniedException"
            | "DisabledException"
            | "KMSInvalidStateException"
            | "IncorrectKeyException"
            | "InvalidCiphertextException"
            | "InvalidKeyUsageException"),
        ) => KmsError::AccessDenied(c.to_owned()),
        Some(c @ "NotFoundException") => KmsError::KeyNotFound(c.to_owned()),
        Some(c) => KmsError::Unavailable(c.to_owned()),
        None => KmsError::Unavailable("request dispatch failed".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_errors_are_fatal() {
        for code in [
            "AccessDeniedException",
            "DisabledException",
            "KMSInvalidStateException",
            "InvalidCiphertextException",
        ] {
            assert!(
                matches!(error_for_code(Some(code)), KmsError::AccessDenied(_)),
                "{code}"
            );
        }
    }

    #[test]
    fn not_found_maps_to_key_not_found() {
        assert!(matches!(
            error_for_code(Some("NotFoundException")),
            KmsError::KeyNotFound(_)
        ));
    }

    #[test]
    fn throttling_and_dispatch_failures_are_retryable() {
        assert!(error_for_code(Some("ThrottlingException")).is_retryable());
        assert!(error_for_code(Some("DependencyTimeoutException")).is_retryable());
        assert!(error_for_code(Some("KMSInternalException")).is_retryable());
        assert!(error_for_code(None).is_retryable());
    }
}
