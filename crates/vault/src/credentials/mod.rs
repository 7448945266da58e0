//! Tenant credential storage, encrypted at rest with the tenant's DEK.
//!
//! Each row is sealed with AES-256-GCM under the tenant's active DEK, a fresh
//! 96-bit nonce per write, and `"<tenant_id>|<provider>"` as associated data,
//! so a row copied to another tenant or provider fails authentication.
//!
//! Writes take the tenant lock. Reads do not: they resolve whichever version
//! the row records, which is always `active` or `retiring`.
//!
//! Rows live behind a [`CredentialRepository`]; [`CredentialTable`] keeps them
//! in memory or in a JSON file.

mod repository;

use std::sync::Arc;

use chrono::Utc;
use common::model::EncryptedCredential;
use common::{ServiceError, TenantContext, TenantId};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::crypto::{cipher, CipherError, Sealed, SecretBytes};
use crate::dek::{DekError, DekManager, TenantGuard, TenantLocks};
use crate::storage::StorageError;
use crate::telemetry::redact::fingerprint;

pub use repository::{CredentialRepository, CredentialTable};

const COMPONENT: &str = "credential_store";

/// Errors produced by the credential store.
///
/// Messages carry provider fingerprints, never raw provider names or payloads.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("key resolution failed")]
    Dek(#[from] DekError),

    /// Authentication tag mismatch: the row was tampered with or corrupted.
    #[error("credential {provider_fp} failed integrity check")]
    Integrity { provider_fp: String },

    #[error("no credential stored for {provider_fp}")]
    NotFound { provider_fp: String },

    #[error("provider name must not be empty")]
    InvalidProvider,

    #[error("credential cipher failure")]
    Cipher(#[source] CipherError),

    #[error("credential storage failure")]
    Storage(#[from] StorageError),
}

impl From<CredentialError> for ServiceError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::NotFound { .. } => ServiceError::NotFound("credential".into()),
            CredentialError::InvalidProvider => {
                ServiceError::BadRequest("provider name must not be empty".into())
            }
            _ => ServiceError::CredentialsUnavailable,
        }
    }
}

/// Encrypted credential rows plus the DEK manager that unlocks them.
#[derive(Clone)]
pub struct CredentialStore {
    dek: DekManager,
    locks: TenantLocks,
    rows: Arc<dyn CredentialRepository>,
}

impl CredentialStore {
    /// A store whose rows live only in memory.
    pub fn new(dek: DekManager, locks: TenantLocks) -> Self {
        Self::with_repository(dek, locks, Arc::new(CredentialTable::new()))
    }

    pub fn with_repository(
        dek: DekManager,
        locks: TenantLocks,
        rows: Arc<dyn CredentialRepository>,
    ) -> Self {
        Self { dek, locks, rows }
    }

    pub fn repository(&self) -> &dyn CredentialRepository {
        self.rows.as_ref()
    }

    /// Encrypt and store `plaintext` for `provider`, replacing any previous value.
    /// Returns the key version used.
    pub async fn put(
        &self,
        ctx: &TenantContext,
        provider: &str,
        plaintext: &[u8],
    ) -> Result<u32, CredentialError> {
        let guard = self.locks.lock(&ctx.tenant_id).await;
        self.put_locked(&guard, ctx, provider, plaintext).await
    }

    /// [`CredentialStore::put`] for callers that already hold the tenant lock.
    pub async fn put_locked(
        &self,
        guard: &TenantGuard,
        ctx: &TenantContext,
        provider: &str,
        plaintext: &[u8],
    ) -> Result<u32, CredentialError> {
        ensure_guard(guard, ctx)?;
        if provider.trim().is_empty() {
            return Err(CredentialError::InvalidProvider);
        }
        let (version, dek) = self.dek.active_key(ctx).await?;
        let row = seal_row(ctx, provider, plaintext, version, dek.as_bytes())?;

        self.rows.upsert(row).await?;

        info!(
            tenant_id = %ctx.tenant_id,
            correlation_id = %ctx.correlation_id,
            component = COMPONENT,
            provider = %fingerprint(provider),
            dek_version = version,
            "credential stored"
        );
        Ok(version)
    }

    /// Decrypt the credential stored for `provider`.
    ///
    /// # Errors
    ///
    /// [`CredentialError::Integrity`] on any authentication failure; no
    /// plaintext is returned in that case.
    pub async fn get(
        &self,
        ctx: &TenantContext,
        provider: &str,
    ) -> Result<SecretBytes, CredentialError> {
        let row = self.row(ctx, provider).await?;
        let dek = match self.dek.key_for_decrypt(ctx, row.dek_version).await {
            Ok(dek) => dek,
            // A rotation may have migrated the row and retired its version
            // between our read and the key lookup. Re-read once.
            Err(DekError::PolicyViolation(_)) => {
                let fresh = self.row(ctx, provider).await?;
                if fresh.dek_version == row.dek_version {
                    return Err(DekError::PolicyViolation(format!(
                        "credential references retired key version {}",
                        row.dek_version
                    ))
                    .into());
                }
                let dek = self.dek.key_for_decrypt(ctx, fresh.dek_version).await?;
                return open_row(ctx, &fresh, dek.as_bytes());
            }
            Err(e) => return Err(e.into()),
        };
        open_row(ctx, &row, dek.as_bytes())
    }

    /// Decrypt every credential the tenant has, keyed by provider.
    pub async fn get_all(
        &self,
        ctx: &TenantContext,
    ) -> Result<Vec<(String, SecretBytes)>, CredentialError> {
        let mut out = Vec::new();
        for provider in self.providers(&ctx.tenant_id).await? {
            let secret = self.get(ctx, &provider).await?;
            out.push((provider, secret));
        }
        Ok(out)
    }

    /// Remove a stored credential. Returns whether one existed.
    pub async fn delete(&self, ctx: &TenantContext, provider: &str) -> Result<bool, CredentialError> {
        let _guard = self.locks.lock(&ctx.tenant_id).await;
        let removed = self.rows.remove(&ctx.tenant_id, provider).await?;
        if removed {
            info!(
                tenant_id = %ctx.tenant_id,
                correlation_id = %ctx.correlation_id,
                component = COMPONENT,
                provider = %fingerprint(provider),
                "credential deleted"
            );
        }
        Ok(removed)
    }

    /// Providers with a stored credential for the tenant, sorted.
    pub async fn providers(&self, tenant_id: &TenantId) -> Result<Vec<String>, CredentialError> {
        Ok(self.rows.providers(tenant_id).await?)
    }

    /// Number of the tenant's rows still encrypted under `version`.
    pub async fn count_on_version(
        &self,
        tenant_id: &TenantId,
        version: u32,
    ) -> Result<usize, CredentialError> {
        Ok(self.rows.count_on_version(tenant_id, version).await?)
    }

    /// Rotation step 3: move up to `limit` rows from version `from` to the
    /// active version `to`. Rows already off `from` are skipped, so repeated
    /// calls are safe. Returns the number of rows migrated.
    pub async fn reencrypt_version(
        &self,
        guard: &TenantGuard,
        ctx: &TenantContext,
        from: u32,
        to: u32,
        limit: usize,
    ) -> Result<usize, CredentialError> {
        ensure_guard(guard, ctx)?;
        let pending = self
            .rows
            .providers_on_version(&ctx.tenant_id, from, limit)
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let old_dek = self.dek.key_for_decrypt(ctx, from).await?;
        let new_dek = self.dek.key_for_encrypt(ctx, to).await?;

        let mut migrated = 0;
        for provider in pending {
            let Some(row) = self.rows.load(&ctx.tenant_id, &provider).await? else {
                continue;
            };
            if row.dek_version != from {
                continue;
            }
            let plaintext = open_row(ctx, &row, old_dek.as_bytes())?;
            let resealed = seal_row(ctx, &provider, plaintext.expose(), to, new_dek.as_bytes())?;
            if !self.rows.replace_if_version(resealed, from).await? {
                continue;
            }
            migrated += 1;

            debug!(
                tenant_id = %ctx.tenant_id,
                correlation_id = %ctx.correlation_id,
                component = COMPONENT,
                provider = %fingerprint(&provider),
                from_version = from,
                to_version = to,
                "credential re-encrypted"
            );
        }
        Ok(migrated)
    }

    async fn row(
        &self,
        ctx: &TenantContext,
        provider: &str,
    ) -> Result<EncryptedCredential, CredentialError> {
        self.rows
            .load(&ctx.tenant_id, provider)
            .await?
            .ok_or_else(|| CredentialError::NotFound {
                provider_fp: fingerprint(provider),
            })
    }
}

fn aad(tenant_id: &TenantId, provider: &str) -> Vec<u8> {
    format!("{tenant_id}|{provider}").into_bytes()
}

fn seal_row(
    ctx: &TenantContext,
    provider: &str,
    plaintext: &[u8],
    version: u32,
    dek: &[u8],
) -> Result<EncryptedCredential, CredentialError> {
    let sealed = cipher::seal(plaintext, dek, &aad(&ctx.tenant_id, provider))
        .map_err(CredentialError::Cipher)?;
    Ok(EncryptedCredential {
        tenant_id: ctx.tenant_id.clone(),
        provider: provider.to_owned(),
        ciphertext: sealed.ciphertext,
        nonce: sealed.nonce,
        tag: sealed.tag,
        dek_version: version,
        updated_at: Utc::now(),
    })
}

fn open_row(
    ctx: &TenantContext,
    row: &EncryptedCredential,
    dek: &[u8],
) -> Result<SecretBytes, CredentialError> {
    let sealed = Sealed {
        nonce: row.nonce,
        ciphertext: row.ciphertext.clone(),
        tag: row.tag,
    };
    match cipher::open(&sealed, dek, &aad(&ctx.tenant_id, &row.provider)) {
        Ok(plaintext) => Ok(SecretBytes::new(plaintext)),
        Err(CipherError::Integrity) => {
            let provider_fp = fingerprint(&row.provider);
            error!(
                tenant_id = %ctx.tenant_id,
                correlation_id = %ctx.correlation_id,
                component = COMPONENT,
                provider = %provider_fp,
                dek_version = row.dek_version,
                alert = true,
                "credential failed integrity check"
            );
            Err(CredentialError::Integrity { provider_fp })
        }
        Err(e) => Err(CredentialError::Cipher(e)),
    }
}

fn ensure_guard(guard: &TenantGuard, ctx: &TenantContext) -> Result<(), CredentialError> {
    debug_assert_eq!(guard.tenant_id(), &ctx.tenant_id, "tenant guard mismatch");
    if guard.tenant_id() != &ctx.tenant_id {
        let violation = DekError::PolicyViolation("tenant lock held for a different tenant".into());
        return Err(violation.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DekBytes;
    use crate::dek::KeyStore;
    use crate::kms::{KmsProvider, LocalKms};

    async fn setup() -> (CredentialStore, DekManager, TenantLocks, TenantContext) {
        let kms = LocalKms::new("local-dev", DekBytes::generate());
        let dek = DekManager::new(Arc::new(kms), KeyStore::new());
        let locks = TenantLocks::new();
        let store = CredentialStore::new(dek.clone(), locks.clone());
        let ctx = TenantContext::fresh(TenantId::parse("t1").unwrap());
        dek.onboard(&ctx).await.unwrap();
        (store, dek, locks, ctx)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (store, _, _, ctx) = setup().await;
        let payloads: [&[u8]; 4] = [b"", b"x", b"ya29.a0AfH6SMB-refresh", &[0u8; 4096]];
        for payload in payloads {
            assert_eq!(store.put(&ctx, "meta", payload).await.unwrap(), 1);
            assert_eq!(store.get(&ctx, "meta").await.unwrap().expose(), payload);
        }
    }

    #[tokio::test]
    async fn rows_are_tenant_scoped() {
        let (store, dek, _, ctx) = setup().await;
        let other = TenantContext::fresh(TenantId::parse("t2").unwrap());
        dek.onboard(&other).await.unwrap();
        store.put(&ctx, "meta", b"t1-token").await.unwrap();

        assert!(matches!(
            store.get(&other, "meta").await,
            Err(CredentialError::NotFound { .. })
        ));
        assert!(store.providers(&other.tenant_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_bit_flips_are_integrity_errors() {
        let (store, _, _, ctx) = setup().await;
        store.put(&ctx, "meta", b"refresh-token").await.unwrap();
        let rows = store.repository();
        let original = rows.load(&ctx.tenant_id, "meta").await.unwrap().unwrap();

        let mut flipped_ct = original.clone();
        flipped_ct.ciphertext[0] ^= 0x01;
        let mut flipped_tag = original.clone();
        flipped_tag.tag[15] ^= 0x80;
        let mut flipped_nonce = original.clone();
        flipped_nonce.nonce[3] ^= 0x10;

        for tampered in [flipped_ct, flipped_tag, flipped_nonce] {
            rows.upsert(tampered).await.unwrap();
            assert!(matches!(
                store.get(&ctx, "meta").await,
                Err(CredentialError::Integrity { .. })
            ));
        }

        rows.upsert(original).await.unwrap();
        assert_eq!(store.get(&ctx, "meta").await.unwrap().expose(), b"refresh-token");
    }

    #[tokio::test]
    async fn row_moved_to_other_provider_fails_authentication() {
        let (store, _, _, ctx) = setup().await;
        store.put(&ctx, "meta", b"meta-token").await.unwrap();
        let rows = store.repository();
        let mut row = rows.load(&ctx.tenant_id, "meta").await.unwrap().unwrap();
        row.provider = "google_ads".into();
        rows.upsert(row).await.unwrap();

        assert!(matches!(
            store.get(&ctx, "google_ads").await,
            Err(CredentialError::Integrity { .. })
        ));
    }

    #[tokio::test]
    async fn reencrypt_moves_rows_and_skips_migrated_ones() {
        let (store, dek, locks, ctx) = setup().await;
        for p in ["a", "b", "c"] {
            store.put(&ctx, p, p.as_bytes()).await.unwrap();
        }
        let guard = locks.lock(&ctx.tenant_id).await;
        dek.begin_rotation(&guard, &ctx).await.unwrap();

        assert_eq!(store.reencrypt_version(&guard, &ctx, 1, 2, 2).await.unwrap(), 2);
        assert_eq!(store.count_on_version(&ctx.tenant_id, 1).await.unwrap(), 1);
        assert_eq!(store.reencrypt_version(&guard, &ctx, 1, 2, 10).await.unwrap(), 1);
        assert_eq!(store.reencrypt_version(&guard, &ctx, 1, 2, 10).await.unwrap(), 0);
        drop(guard);

        for p in ["a", "b", "c"] {
            assert_eq!(store.get(&ctx, p).await.unwrap().expose(), p.as_bytes());
        }
    }

    #[tokio::test]
    async fn put_uses_active_version_after_rotation() {
        let (store, dek, locks, ctx) = setup().await;
        {
            let guard = locks.lock(&ctx.tenant_id).await;
            dek.begin_rotation(&guard, &ctx).await.unwrap();
        }
        assert_eq!(store.put(&ctx, "meta", b"v2").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_and_get_all() {
        let (store, _, _, ctx) = setup().await;
        store.put(&ctx, "meta", b"m").await.unwrap();
        store.put(&ctx, "google_ads", b"g").await.unwrap();

        let all = store.get_all(&ctx).await.unwrap();
        let names: Vec<_> = all.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(names, vec!["google_ads", "meta"]);

        assert!(store.delete(&ctx, "meta").await.unwrap());
        assert!(!store.delete(&ctx, "meta").await.unwrap());
        assert_eq!(store.providers(&ctx.tenant_id).await.unwrap(), vec!["google_ads"]);
    }

    #[test]
    fn service_error_never_exposes_classification() {
        let err: ServiceError = CredentialError::Integrity {
            provider_fp: fingerprint("meta"),
        }
        .into();
        assert_eq!(err.to_string(), "unable to process credentials");
        let err: ServiceError = CredentialError::Dek(DekError::PolicyViolation("x".into())).into();
        assert_eq!(err.to_string(), "unable to process credentials");
    }

    async fn open_persistent(
        dir: &std::path::Path,
        kms: Arc<dyn KmsProvider>,
    ) -> (CredentialStore, DekManager) {
        let keys = KeyStore::open(dir.join("keys.json")).await.unwrap();
        let rows = CredentialTable::open(dir.join("credentials.json")).await.unwrap();
        let dek = DekManager::new(kms, keys);
        let store = CredentialStore::with_repository(dek.clone(), TenantLocks::new(), Arc::new(rows));
        (store, dek)
    }

    #[tokio::test]
    async fn credentials_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let kms: Arc<dyn KmsProvider> = Arc::new(LocalKms::new("local-dev", DekBytes::generate()));
        let ctx = TenantContext::fresh(TenantId::parse("t1").unwrap());
        {
            let (store, dek) = open_persistent(dir.path(), kms.clone()).await;
            dek.onboard(&ctx).await.unwrap();
            store.put(&ctx, "meta", b"refresh-token").await.unwrap();
        }

        let (store, _) = open_persistent(dir.path(), kms).await;
        assert_eq!(store.get(&ctx, "meta").await.unwrap().expose(), b"refresh-token");
    }

    #[tokio::test]
    async fn empty_provider_rejected() {
        let (store, _, _, ctx) = setup().await;
        assert!(matches!(
            store.put(&ctx, " ", b"x").await,
            Err(CredentialError::InvalidProvider)
        ));
    }
}
