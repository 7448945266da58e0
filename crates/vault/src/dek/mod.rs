//! Per-tenant Data Encryption Key lifecycle.
//!
//! # Lifecycle
//!
//! 1. [`DekManager::onboard`] generates a 256-bit DEK, wraps it through the
//!    [`KmsProvider`] and stores it as the tenant's active version 1.
//! 2. Encryption always resolves the active version via
//!    [`DekManager::active_key`]; decryption resolves the version recorded on
//!    the ciphertext via [`DekManager::key_for_decrypt`].
//! 3. Rotation ([`rotation::KeyRotation`]) promotes a new version, migrates
//!    every credential off the old one and then retires it.
//!
//! Unwrapped DEKs are cached per `(tenant, version)` so steady-state reads do
//! not call the KMS.
//!
//! # Security invariants
//!
//! - The plaintext DEK is **never** written to disk, logged, or included in traces.
//! - A tenant has exactly one active version at every observable point.
//! - Retired versions are kept forever but never used to encrypt or decrypt.

pub mod locks;
pub mod rotation;
pub mod store;

pub use locks::{TenantGuard, TenantLocks};
pub use rotation::{KeyRotation, RotationReport};
pub use store::{KeyRepository, KeyStore};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::model::{KeyState, TenantKey, TenantKeyInfo};
use common::{TenantContext, TenantId};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::crypto::DekBytes;
use crate::kms::{KmsError, KmsProvider, WrappedKey};
use crate::storage::StorageError;

const COMPONENT: &str = "dek_manager";

/// Errors produced by the DEK layer.
#[derive(Debug, Error)]
pub enum DekError {
    #[error(transparent)]
    Kms(#[from] KmsError),

    /// The key repository could not be read or written. Retryable.
    #[error("key storage failure")]
    Storage(#[from] StorageError),

    #[error("tenant {0} has no keys")]
    UnknownTenant(TenantId),

    #[error("tenant {0} is already onboarded")]
    AlreadyOnboarded(TenantId),

    #[error("tenant {tenant_id} has no key version {version}")]
    UnknownVersion { tenant_id: TenantId, version: u32 },

    /// A previous rotation has not retired its old version yet.
    #[error("a rotation is still in progress for tenant {0}")]
    RotationInProgress(TenantId),

    /// Stored key rows break the one-active-version invariant.
    #[error("malformed key state for tenant {tenant_id}: {reason}")]
    MalformedState { tenant_id: TenantId, reason: String },

    /// Contract violation by the caller, e.g. decrypting with a retired
    /// version or encrypting with anything but the active one.
    #[error("key policy violation: {0}")]
    PolicyViolation(String),
}

/// Outcome of rotation steps 1 and 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotedKey {
    pub new_version: u32,
    pub retiring_version: u32,
}

/// Owns tenant key rows and resolves plaintext DEKs.
#[derive(Clone)]
pub struct DekManager {
    kms: Arc<dyn KmsProvider>,
    store: Arc<dyn KeyRepository>,
    cache: Arc<RwLock<HashMap<(TenantId, u32), DekBytes>>>,
}

impl DekManager {
    pub fn new(kms: Arc<dyn KmsProvider>, store: impl KeyRepository + 'static) -> Self {
        Self::with_repository(kms, Arc::new(store))
    }

    pub fn with_repository(kms: Arc<dyn KmsProvider>, store: Arc<dyn KeyRepository>) -> Self {
        Self {
            kms,
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &dyn KeyRepository {
        self.store.as_ref()
    }

    /// Create the first DEK for a new tenant.
    ///
    /// # Errors
    ///
    /// Fails without creating any row if the KMS wrap fails, or with
    /// [`DekError::AlreadyOnboarded`] if the tenant already has keys.
    pub async fn onboard(&self, ctx: &TenantContext) -> Result<TenantKeyInfo, DekError> {
        if self.store.contains(&ctx.tenant_id).await? {
            return Err(DekError::AlreadyOnboarded(ctx.tenant_id.clone()));
        }
        let dek = DekBytes::generate();
        let wrapped = self.kms.wrap(&dek, ctx).await?;
        let key = new_key_row(&ctx.tenant_id, 1, wrapped);
        let info = TenantKeyInfo::from(&key);

        self.store.insert_initial(key).await?;
        self.cache_put(&ctx.tenant_id, 1, dek).await;

        info!(
            tenant_id = %ctx.tenant_id,
            correlation_id = %ctx.correlation_id,
            component = COMPONENT,
            version = 1u32,
            "tenant onboarded"
        );
        Ok(info)
    }

    /// The active version and its plaintext DEK, for new encryption.
    pub async fn active_key(&self, ctx: &TenantContext) -> Result<(u32, DekBytes), DekError> {
        let row = self.store.active(&ctx.tenant_id).await.inspect_err(|e| {
            if matches!(e, DekError::MalformedState { .. }) {
                error!(
                    tenant_id = %ctx.tenant_id,
                    correlation_id = %ctx.correlation_id,
                    component = COMPONENT,
                    alert = true,
                    error = %e,
                    "tenant key state is malformed"
                );
            }
        })?;
        let dek = self.unwrap_row(ctx, &row).await?;
        Ok((row.version, dek))
    }

    /// Plaintext DEK for `version`, which must be the active version.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::PolicyViolation`] if `version` is not active.
    pub async fn key_for_encrypt(
        &self,
        ctx: &TenantContext,
        version: u32,
    ) -> Result<DekBytes, DekError> {
        let row = self.store.get(&ctx.tenant_id, version).await?;
        debug_assert!(
            row.state.can_encrypt(),
            "encrypting with {} key version {version}",
            row.state
        );
        if !row.state.can_encrypt() {
            return Err(policy_violation(
                ctx,
                format!("cannot encrypt with {} key version {version}", row.state),
            ));
        }
        self.unwrap_row(ctx, &row).await
    }

    /// Plaintext DEK for an `active` or `retiring` version.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::PolicyViolation`] if the version is retired.
    pub async fn key_for_decrypt(
        &self,
        ctx: &TenantContext,
        version: u32,
    ) -> Result<DekBytes, DekError> {
        let row = self.store.get(&ctx.tenant_id, version).await?;
        if !row.state.can_decrypt() {
            return Err(policy_violation(
                ctx,
                format!("cannot decrypt with {} key version {version}", row.state),
            ));
        }
        self.unwrap_row(ctx, &row).await
    }

    /// Rotation steps 1 and 2: wrap a fresh DEK and promote it.
    ///
    /// If the KMS wrap fails nothing is written.
    pub async fn begin_rotation(
        &self,
        guard: &TenantGuard,
        ctx: &TenantContext,
    ) -> Result<PromotedKey, DekError> {
        ensure_guard(guard, ctx)?;
        let current = self.store.active(&ctx.tenant_id).await?;
        let new_version = self
            .store
            .versions(&ctx.tenant_id)
            .await?
            .iter()
            .map(|k| k.version)
            .max()
            .unwrap_or(current.version)
            + 1;

        let dek = DekBytes::generate();
        let wrapped = self.kms.wrap(&dek, ctx).await?;
        let row = new_key_row(&ctx.tenant_id, new_version, wrapped);

        let retiring_version = self.store.promote(row).await?;
        self.cache_put(&ctx.tenant_id, new_version, dek).await;

        info!(
            tenant_id = %ctx.tenant_id,
            correlation_id = %ctx.correlation_id,
            component = COMPONENT,
            new_version,
            retiring_version,
            "new key version promoted"
        );
        Ok(PromotedKey {
            new_version,
            retiring_version,
        })
    }

    /// Rotation step 4: retire the old version and evict its cached DEK.
    pub async fn finish_rotation(
        &self,
        guard: &TenantGuard,
        ctx: &TenantContext,
        retiring_version: u32,
    ) -> Result<(), DekError> {
        ensure_guard(guard, ctx)?;
        self.store
            .retire(&ctx.tenant_id, retiring_version, Utc::now())
            .await?;
        self.cache
            .write()
            .await
            .remove(&(ctx.tenant_id.clone(), retiring_version));

        info!(
            tenant_id = %ctx.tenant_id,
            correlation_id = %ctx.correlation_id,
            component = COMPONENT,
            version = retiring_version,
            "key version retired"
        );
        Ok(())
    }

    pub async fn retiring_version(&self, tenant_id: &TenantId) -> Result<Option<u32>, DekError> {
        Ok(self.store.retiring(tenant_id).await?.map(|k| k.version))
    }

    /// Tenants whose active key is older than `interval` at `now`.
    ///
    /// Tenants with malformed key state are skipped with a warning.
    pub async fn tenants_due_for_rotation(
        &self,
        now: DateTime<Utc>,
        interval: Duration,
    ) -> Vec<TenantId> {
        let max_age = chrono::Duration::from_std(interval)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut due = Vec::new();
        for tenant_id in self.tenants_or_empty().await {
            match self.store.active(&tenant_id).await {
                Ok(key) if now - key.created_at >= max_age => due.push(tenant_id),
                Ok(_) => {}
                Err(e) => warn!(
                    tenant_id = %tenant_id,
                    component = COMPONENT,
                    error = %e,
                    "skipping tenant with unreadable key state"
                ),
            }
        }
        due
    }

    /// Tenants left with a `retiring` version by an interrupted rotation.
    pub async fn unfinished_rotations(&self) -> Vec<TenantId> {
        let mut unfinished = Vec::new();
        for tenant_id in self.tenants_or_empty().await {
            if let Ok(Some(_)) = self.store.retiring(&tenant_id).await {
                unfinished.push(tenant_id);
            }
        }
        unfinished
    }

    /// Key metadata for operators. Never includes wrapped key bytes.
    pub async fn key_info(&self, tenant_id: &TenantId) -> Result<Vec<TenantKeyInfo>, DekError> {
        Ok(self
            .store
            .versions(tenant_id)
            .await?
            .iter()
            .map(TenantKeyInfo::from)
            .collect())
    }

    async fn tenants_or_empty(&self) -> Vec<TenantId> {
        self.store.tenants().await.unwrap_or_else(|e| {
            warn!(component = COMPONENT, error = %e, "cannot list tenants");
            Vec::new()
        })
    }

    async fn unwrap_row(&self, ctx: &TenantContext, row: &TenantKey) -> Result<DekBytes, DekError> {
        let slot = (ctx.tenant_id.clone(), row.version);
        if let Some(dek) = self.cache.read().await.get(&slot) {
            return Ok(dek.clone());
        }
        let wrapped = WrappedKey {
            kms_key_id: row.kms_key_id.clone(),
            ciphertext: row.wrapped_dek.clone(),
        };
        let dek = self.kms.unwrap(&wrapped, ctx).await?;
        self.cache.write().await.insert(slot, dek.clone());
        Ok(dek)
    }

    async fn cache_put(&self, tenant_id: &TenantId, version: u32, dek: DekBytes) {
        self.cache
            .write()
            .await
            .insert((tenant_id.clone(), version), dek);
    }
}

fn new_key_row(tenant_id: &TenantId, version: u32, wrapped: WrappedKey) -> TenantKey {
    TenantKey {
        tenant_id: tenant_id.clone(),
        version,
        wrapped_dek: wrapped.ciphertext,
        kms_key_id: wrapped.kms_key_id,
        created_at: Utc::now(),
        retired_at: None,
        state: KeyState::Active,
    }
}

fn ensure_guard(guard: &TenantGuard, ctx: &TenantContext) -> Result<(), DekError> {
    debug_assert_eq!(guard.tenant_id(), &ctx.tenant_id, "tenant guard mismatch");
    if guard.tenant_id() != &ctx.tenant_id {
        return Err(DekError::PolicyViolation(
            "tenant lock held for a different tenant".into(),
        ));
    }
    Ok(())
}

fn policy_violation(ctx: &TenantContext, message: String) -> DekError {
    error!(
        tenant_id = %ctx.tenant_id,
        correlation_id = %ctx.correlation_id,
        component = COMPONENT,
        alert = true,
        violation = %message,
        "key policy violation"
    );
    DekError::PolicyViolation(message)
}
