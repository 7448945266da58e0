//! Tenant key rows: the [`KeyRepository`] seam and its [`KeyStore`]
//! implementation.
//!
//! Every state transition happens in one repository call, so readers never see
//! a tenant with two `active` rows or with none. [`KeyRepository::promote`] is
//! the only way a tenant gets a new active version. Rows are never deleted;
//! retired versions stay resolvable for as long as the store exists.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::model::{KeyState, TenantKey};
use common::TenantId;

use super::DekError;
use crate::storage::{StateCell, StorageError};

/// Durable storage of [`TenantKey`] rows.
///
/// Implementations must apply each call atomically: a concurrent reader sees
/// the rows either before or after a [`KeyRepository::promote`], never between.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    /// Insert the first key of a newly onboarded tenant.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::AlreadyOnboarded`] if the tenant already has keys and
    /// [`DekError::PolicyViolation`] unless `key` is an active version 1.
    async fn insert_initial(&self, key: TenantKey) -> Result<(), DekError>;

    /// Atomically demote the current active row to `retiring` and insert `new`
    /// as the active row. Returns the demoted version.
    ///
    /// # Errors
    ///
    /// - [`DekError::UnknownTenant`] if the tenant has no keys.
    /// - [`DekError::RotationInProgress`] while a `retiring` row still exists.
    /// - [`DekError::PolicyViolation`] if `new` is not active or its version is
    ///   not greater than every existing version.
    /// - [`DekError::MalformedState`] if the tenant does not have exactly one
    ///   active row.
    async fn promote(&self, new: TenantKey) -> Result<u32, DekError>;

    /// Mark a `retiring` version as `retired`. Retiring an already retired
    /// version is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::PolicyViolation`] if the version is active.
    async fn retire(
        &self,
        tenant_id: &TenantId,
        version: u32,
        at: DateTime<Utc>,
    ) -> Result<(), DekError>;

    /// The tenant's single active row.
    ///
    /// # Errors
    ///
    /// [`DekError::UnknownTenant`] or [`DekError::MalformedState`].
    async fn active(&self, tenant_id: &TenantId) -> Result<TenantKey, DekError>;

    /// The tenant's `retiring` row, if a rotation has not finished.
    async fn retiring(&self, tenant_id: &TenantId) -> Result<Option<TenantKey>, DekError>;

    async fn get(&self, tenant_id: &TenantId, version: u32) -> Result<TenantKey, DekError>;

    /// Every version of the tenant's key, oldest first. Empty for unknown
    /// tenants.
    async fn versions(&self, tenant_id: &TenantId) -> Result<Vec<TenantKey>, DekError>;

    /// Every onboarded tenant, sorted.
    async fn tenants(&self) -> Result<Vec<TenantId>, DekError>;

    async fn contains(&self, tenant_id: &TenantId) -> Result<bool, DekError>;
}

type KeyRows = HashMap<TenantId, Vec<TenantKey>>;

/// [`KeyRepository`] held in memory, optionally written through to a JSON
/// file.
#[derive(Clone)]
pub struct KeyStore {
    cell: Arc<StateCell<KeyRows>>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    /// A store that lives only as long as the process.
    pub fn new() -> Self {
        Self {
            cell: Arc::new(StateCell::memory()),
        }
    }

    /// A store persisted to `path`, loading any rows already there.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Ok(Self {
            cell: Arc::new(StateCell::open(path).await?),
        })
    }
}

#[async_trait]
impl KeyRepository for KeyStore {
    async fn insert_initial(&self, key: TenantKey) -> Result<(), DekError> {
        if key.version != 1 || key.state != KeyState::Active {
            return Err(DekError::PolicyViolation(
                "initial tenant key must be an active version 1".into(),
            ));
        }
        self.cell
            .mutate(|rows| {
                if rows.contains_key(&key.tenant_id) {
                    return Err(DekError::AlreadyOnboarded(key.tenant_id.clone()));
                }
                rows.insert(key.tenant_id.clone(), vec![key]);
                Ok(())
            })
            .await
    }

    async fn promote(&self, new: TenantKey) -> Result<u32, DekError> {
        self.cell
            .mutate(|rows| {
                let keys = rows
                    .get_mut(&new.tenant_id)
                    .ok_or_else(|| DekError::UnknownTenant(new.tenant_id.clone()))?;

                let active_idx = single_active(&new.tenant_id, keys)?;
                if keys.iter().any(|k| k.state == KeyState::Retiring) {
                    return Err(DekError::RotationInProgress(new.tenant_id.clone()));
                }
                if new.state != KeyState::Active {
                    return Err(DekError::PolicyViolation(
                        "promoted key must be in the active state".into(),
                    ));
                }
                let max_version = keys.iter().map(|k| k.version).max().unwrap_or(0);
                if new.version <= max_version {
                    return Err(DekError::PolicyViolation(format!(
                        "key version {} is not greater than existing version {max_version}",
                        new.version
                    )));
                }

                let demoted = &mut keys[active_idx];
                demoted.state = KeyState::Retiring;
                let demoted_version = demoted.version;
                keys.push(new);
                Ok(demoted_version)
            })
            .await
    }

    async fn retire(
        &self,
        tenant_id: &TenantId,
        version: u32,
        at: DateTime<Utc>,
    ) -> Result<(), DekError> {
        self.cell
            .mutate(|rows| {
                let key = rows
                    .get_mut(tenant_id)
                    .and_then(|keys| keys.iter_mut().find(|k| k.version == version))
                    .ok_or_else(|| DekError::UnknownVersion {
                        tenant_id: tenant_id.clone(),
                        version,
                    })?;

                match key.state {
                    KeyState::Retired => Ok(()),
                    KeyState::Retiring => {
                        key.state = KeyState::Retired;
                        key.retired_at = Some(at);
                        Ok(())
                    }
                    KeyState::Active => Err(DekError::PolicyViolation(format!(
                        "refusing to retire active key version {version}"
                    ))),
                }
            })
            .await
    }

    async fn active(&self, tenant_id: &TenantId) -> Result<TenantKey, DekError> {
        let rows = self.cell.read().await;
        let keys = rows
            .get(tenant_id)
            .ok_or_else(|| DekError::UnknownTenant(tenant_id.clone()))?;
        let idx = single_active(tenant_id, keys)?;
        Ok(keys[idx].clone())
    }

    async fn retiring(&self, tenant_id: &TenantId) -> Result<Option<TenantKey>, DekError> {
        let rows = self.cell.read().await;
        let keys = rows
            .get(tenant_id)
            .ok_or_else(|| DekError::UnknownTenant(tenant_id.clone()))?;
        let mut retiring = keys.iter().filter(|k| k.state == KeyState::Retiring);
        let first = retiring.next().cloned();
        if retiring.next().is_some() {
            return Err(DekError::MalformedState {
                tenant_id: tenant_id.clone(),
                reason: "more than one retiring key".into(),
            });
        }
        Ok(first)
    }

    async fn get(&self, tenant_id: &TenantId, version: u32) -> Result<TenantKey, DekError> {
        let rows = self.cell.read().await;
        rows.get(tenant_id)
            .and_then(|keys| keys.iter().find(|k| k.version == version))
            .cloned()
            .ok_or_else(|| DekError::UnknownVersion {
                tenant_id: tenant_id.clone(),
                version,
            })
    }

    async fn versions(&self, tenant_id: &TenantId) -> Result<Vec<TenantKey>, DekError> {
        let rows = self.cell.read().await;
        Ok(rows.get(tenant_id).cloned().unwrap_or_default())
    }

    async fn tenants(&self) -> Result<Vec<TenantId>, DekError> {
        let rows = self.cell.read().await;
        let mut ids: Vec<TenantId> = rows.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn contains(&self, tenant_id: &TenantId) -> Result<bool, DekError> {
        Ok(self.cell.read().await.contains_key(tenant_id))
    }
}

/// Index of the only active row, or [`DekError::MalformedState`].
fn single_active(tenant_id: &TenantId, keys: &[TenantKey]) -> Result<usize, DekError> {
    let mut active = keys
        .iter()
        .enumerate()
        .filter(|(_, k)| k.state == KeyState::Active)
        .map(|(i, _)| i);
    match (active.next(), active.next()) {
        (Some(idx), None) => Ok(idx),
        (None, _) => Err(DekError::MalformedState {
            tenant_id: tenant_id.clone(),
            reason: "no active key".into(),
        }),
        (Some(_), Some(_)) => Err(DekError::MalformedState {
            tenant_id: tenant_id.clone(),
            reason: "more than one active key".into(),
        }),
    }
}
