//! Storage seam for [`EncryptedCredential`] rows.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use common::model::EncryptedCredential;
use common::TenantId;

use crate::storage::{StateCell, StorageError};

/// Durable storage of encrypted credential rows, one per `(tenant, provider)`.
///
/// Rows are opaque here: repositories never see plaintext or keys.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn load(
        &self,
        tenant_id: &TenantId,
        provider: &str,
    ) -> Result<Option<EncryptedCredential>, StorageError>;

    /// Insert or replace the row for `(row.tenant_id, row.provider)`.
    async fn upsert(&self, row: EncryptedCredential) -> Result<(), StorageError>;

    /// Replace the row only while the stored copy is still encrypted under
    /// `expected_version`. Returns whether the row was replaced.
    async fn replace_if_version(
        &self,
        row: EncryptedCredential,
        expected_version: u32,
    ) -> Result<bool, StorageError>;

    /// Returns whether a row existed.
    async fn remove(&self, tenant_id: &TenantId, provider: &str) -> Result<bool, StorageError>;

    /// The tenant's providers, sorted.
    async fn providers(&self, tenant_id: &TenantId) -> Result<Vec<String>, StorageError>;

    /// Up to `limit` of the tenant's providers whose row is on `version`, sorted.
    async fn providers_on_version(
        &self,
        tenant_id: &TenantId,
        version: u32,
        limit: usize,
    ) -> Result<Vec<String>, StorageError>;

    async fn count_on_version(&self, tenant_id: &TenantId, version: u32)
        -> Result<usize, StorageError>;
}

type Rows = HashMap<TenantId, BTreeMap<String, EncryptedCredential>>;

/// [`CredentialRepository`] held in memory, optionally written through to a
/// JSON file.
#[derive(Clone)]
pub struct CredentialTable {
    cell: Arc<StateCell<Rows>>,
}

impl Default for CredentialTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialTable {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(StateCell::memory()),
        }
    }

    /// A table persisted to `path`, loading any rows already there.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Ok(Self {
            cell: Arc::new(StateCell::open(path).await?),
        })
    }
}

#[async_trait]
impl CredentialRepository for CredentialTable {
    async fn load(
        &self,
        tenant_id: &TenantId,
        provider: &str,
    ) -> Result<Option<EncryptedCredential>, StorageError> {
        let rows = self.cell.read().await;
        Ok(rows.get(tenant_id).and_then(|t| t.get(provider)).cloned())
    }

    async fn upsert(&self, row: EncryptedCredential) -> Result<(), StorageError> {
        self.cell
            .mutate(|rows| {
                rows.entry(row.tenant_id.clone())
                    .or_default()
                    .insert(row.provider.clone(), row);
                Ok(())
            })
            .await
    }

    async fn replace_if_version(
        &self,
        row: EncryptedCredential,
        expected_version: u32,
    ) -> Result<bool, StorageError> {
        self.cell
            .mutate(|rows| {
                let Some(slot) = rows
                    .get_mut(&row.tenant_id)
                    .and_then(|t| t.get_mut(&row.provider))
                else {
                    return Ok(false);
                };
                if slot.dek_version != expected_version {
                    return Ok(false);
                }
                *slot = row;
                Ok(true)
            })
            .await
    }

    async fn remove(&self, tenant_id: &TenantId, provider: &str) -> Result<bool, StorageError> {
        self.cell
            .mutate(|rows| {
                let Some(tenant_rows) = rows.get_mut(tenant_id) else {
                    return Ok(false);
                };
                let removed = tenant_rows.remove(provider).is_some();
                if tenant_rows.is_empty() {
                    rows.remove(tenant_id);
                }
                Ok(removed)
            })
            .await
    }

    async fn providers(&self, tenant_id: &TenantId) -> Result<Vec<String>, StorageError> {
        let rows = self.cell.read().await;
        Ok(rows
            .get(tenant_id)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn providers_on_version(
        &self,
        tenant_id: &TenantId,
        version: u32,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let rows = self.cell.read().await;
        Ok(rows
            .get(tenant_id)
            .map(|t| {
                t.values()
                    .filter(|row| row.dek_version == version)
                    .take(limit)
                    .map(|row| row.provider.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_on_version(
        &self,
        tenant_id: &TenantId,
        version: u32,
    ) -> Result<usize, StorageError> {
        let rows = self.cell.read().await;
        Ok(rows
            .get(tenant_id)
            .map_or(0, |t| t.values().filter(|row| row.dek_version == version).count()))
    }
}
