//! Per-tenant write locks.
//!
//! At most one key-mutating operation runs per tenant. A [`TenantGuard`] is
//! the proof that the caller holds the tenant's lock; APIs that change key or
//! credential rows take `&TenantGuard` rather than trusting the caller.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use common::TenantId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-tenant async mutexes, created on first use.
#[derive(Clone, Default)]
pub struct TenantLocks {
    inner: Arc<Mutex<HashMap<TenantId, Arc<Mutex<()>>>>>,
}

/// Held write lock for one tenant. Released on drop.
pub struct TenantGuard {
    tenant_id: TenantId,
    _held: OwnedMutexGuard<()>,
}

impl TenantGuard {
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

impl fmt::Debug for TenantGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantGuard")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, tenant_id: &TenantId) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().await;
        map.entry(tenant_id.clone()).or_default().clone()
    }

    /// Wait for and acquire the tenant's lock.
    pub async fn lock(&self, tenant_id: &TenantId) -> TenantGuard {
        let held = self.slot(tenant_id).await.lock_owned().await;
        TenantGuard {
            tenant_id: tenant_id.clone(),
            _held: held,
        }
    }

    /// Acquire the tenant's lock only if nobody holds it.
    pub async fn try_lock(&self, tenant_id: &TenantId) -> Option<TenantGuard> {
        let held = self.slot(tenant_id).await.try_lock_owned().ok()?;
        Some(TenantGuard {
            tenant_id: tenant_id.clone(),
            _held: held,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn t(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn same_tenant_is_exclusive() {
        let locks = TenantLocks::new();
        let guard = locks.lock(&t("t1")).await;
        assert!(locks.try_lock(&t("t1")).await.is_none());
        drop(guard);
        assert!(locks.try_lock(&t("t1")).await.is_some());
    }

    #[tokio::test]
    async fn different_tenants_do_not_contend() {
        let locks = TenantLocks::new();
        let _a = locks.lock(&t("t1")).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(&t("t2"))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let locks = TenantLocks::new();
        let guard = locks.lock(&t("t1")).await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.lock(&t("t1")).await.tenant_id().clone() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        assert_eq!(waiter.await.unwrap(), t("t1"));
    }
}
