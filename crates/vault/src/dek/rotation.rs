//! Tenant key rotation.
//!
//! 1. Wrap a fresh DEK and promote it; the previous active version becomes
//!    `retiring` in the same transition.
//! 2. Re-encrypt every credential still on the retiring version, in batches.
//! 3. Retire the old version once nothing references it.
//!
//! A rotation interrupted anywhere after step 1 leaves a `retiring` row behind.
//! The next call to [`KeyRotation::rotate`] picks that row up and finishes
//! steps 2 and 3 instead of minting another version.

use common::TenantContext;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{DekError, DekManager, KeyRepository, TenantGuard};
use crate::credentials::CredentialStore;
use crate::tasks::TaskError;
use crate::telemetry::Metrics;

const COMPONENT: &str = "key_rotation";

/// Credentials migrated between cancellation checks.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Outcome of a completed rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub new_version: u32,
    pub retired_version: u32,
    /// Rows migrated by this call; a resumed run counts only its own share.
    pub reencrypted: usize,
    /// Whether an earlier, unfinished rotation was completed.
    pub resumed: bool,
}

#[derive(Clone)]
pub struct KeyRotation {
    dek: DekManager,
    credentials: CredentialStore,
    metrics: Metrics,
    batch_size: usize,
}

impl KeyRotation {
    pub fn new(dek: DekManager, credentials: CredentialStore, metrics: Metrics) -> Self {
        Self {
            dek,
            credentials,
            metrics,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Rotate the tenant's DEK, or finish a rotation left half-done.
    ///
    /// Cancellation is checked before any state change and between batches;
    /// a cancelled rotation leaves a `retiring` version that the next run
    /// resumes.
    pub async fn rotate(
        &self,
        guard: &TenantGuard,
        ctx: &TenantContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RotationReport> {
        let result = self.run(guard, ctx, cancel).await;
        match &result {
            Ok(report) => {
                self.metrics.rotation(true);
                info!(
                    tenant_id = %ctx.tenant_id,
                    correlation_id = %ctx.correlation_id,
                    component = COMPONENT,
                    new_version = report.new_version,
                    retired_version = report.retired_version,
                    reencrypted = report.reencrypted as u64,
                    resumed = report.resumed,
                    "rotation complete"
                );
            }
            Err(e) if is_cancelled(e) => {}
            Err(e) => {
                self.metrics.rotation(false);
                warn!(
                    tenant_id = %ctx.tenant_id,
                    correlation_id = %ctx.correlation_id,
                    component = COMPONENT,
                    error = %format!("{e:#}"),
                    "rotation attempt failed"
                );
            }
        }
        result
    }

    async fn run(
        &self,
        guard: &TenantGuard,
        ctx: &TenantContext,
        cancel: &CancellationToken,
    ) -> anyhow::Result<RotationReport> {
        check_cancel(cancel)?;

        let (new_version, retiring_version, resumed) =
            match self.dek.retiring_version(&ctx.tenant_id).await? {
                Some(retiring) => {
                    let active = self.dek.store().active(&ctx.tenant_id).await?;
                    info!(
                        tenant_id = %ctx.tenant_id,
                        correlation_id = %ctx.correlation_id,
                        component = COMPONENT,
                        active_version = active.version,
                        retiring_version = retiring,
                        "resuming unfinished rotation"
                    );
                    (active.version, retiring, true)
                }
                None => {
                    let promoted = self.dek.begin_rotation(guard, ctx).await?;
                    (promoted.new_version, promoted.retiring_version, false)
                }
            };

        let mut reencrypted = 0;
        loop {
            check_cancel(cancel)?;
            let moved = self
                .credentials
                .reencrypt_version(guard, ctx, retiring_version, new_version, self.batch_size)
                .await?;
            reencrypted += moved;
            if moved < self.batch_size {
                break;
            }
        }

        let left = self
            .credentials
            .count_on_version(&ctx.tenant_id, retiring_version)
            .await?;
        if left > 0 {
            return Err(DekError::MalformedState {
                tenant_id: ctx.tenant_id.clone(),
                reason: format!("{left} credentials still on version {retiring_version}"),
            }
            .into());
        }

        self.dek.finish_rotation(guard, ctx, retiring_version).await?;
        Ok(RotationReport {
            new_version,
            retired_version: retiring_version,
            reencrypted,
            resumed,
        })
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), TaskError> {
    if cancel.is_cancelled() {
        return Err(TaskError::Cancelled);
    }
    Ok(())
}

fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<TaskError>(), Some(TaskError::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use common::model::KeyState;
    use common::TenantId;

    use crate::crypto::DekBytes;
    use crate::dek::{KeyStore, TenantLocks};
    use crate::kms::{KmsError, KmsProvider, LocalKms, WrappedKey};

    struct Fixture {
        dek: DekManager,
        credentials: CredentialStore,
        locks: TenantLocks,
        metrics: Metrics,
        ctx: TenantContext,
    }

    impl Fixture {
        fn rotation(&self) -> KeyRotation {
            KeyRotation::new(self.dek.clone(), self.credentials.clone(), self.metrics.clone())
                .with_batch_size(2)
        }
    }

    async fn fixture_with(kms: Arc<dyn KmsProvider>, providers: &[&str]) -> Fixture {
        let locks = TenantLocks::new();
        let dek = DekManager::new(kms, KeyStore::new());
        let credentials = CredentialStore::new(dek.clone(), locks.clone());
        let ctx = TenantContext::fresh(TenantId::parse("t1").unwrap());
        dek.onboard(&ctx).await.unwrap();
        for provider in providers {
            credentials
                .put(&ctx, provider, format!("secret-{provider}").as_bytes())
                .await
                .unwrap();
        }
        Fixture {
            dek,
            credentials,
            locks,
            metrics: Metrics::new(),
            ctx,
        }
    }

    async fn fixture(providers: &[&str]) -> Fixture {
        fixture_with(Arc::new(LocalKms::new("local-dev", DekBytes::generate())), providers).await
    }

    async fn assert_readable(f: &Fixture, providers: &[&str]) {
        for provider in providers {
            let secret = f.credentials.get(&f.ctx, provider).await.unwrap();
            assert_eq!(secret.expose(), format!("secret-{provider}").as_bytes());
        }
    }

    const PROVIDERS: [&str; 5] = ["google_ads", "linkedin", "meta", "snap", "tiktok"];

    #[tokio::test]
    async fn rotation_moves_every_credential_and_retires_old_version() {
        let f = fixture(&PROVIDERS).await;
        let guard = f.locks.lock(&f.ctx.tenant_id).await;

        let report = f
            .rotation()
            .rotate(&guard, &f.ctx, &CancellationToken::new())
            .await
            .unwrap();
        drop(guard);

        assert_eq!(
            report,
            RotationReport {
                new_version: 2,
                retired_version: 1,
                reencrypted: 5,
                resumed: false,
            }
        );
        let states: Vec<_> = f
            .dek
            .key_info(&f.ctx.tenant_id)
            .await
            .unwrap()
            .into_iter()
            .map(|k| (k.version, k.state))
            .collect();
        assert_eq!(states, vec![(1, KeyState::Retired), (2, KeyState::Active)]);
        assert_eq!(f.credentials.count_on_version(&f.ctx.tenant_id, 2).await.unwrap(), 5);
        assert_readable(&f, &PROVIDERS).await;
        assert_eq!(f.metrics.snapshot().rotation_successes, 1);
    }

    #[tokio::test]
    async fn interrupted_rotation_resumes_to_same_end_state() {
        let f = fixture(&PROVIDERS).await;
        let guard = f.locks.lock(&f.ctx.tenant_id).await;

        // Simulate a crash after promoting and migrating two rows.
        let promoted = f.dek.begin_rotation(&guard, &f.ctx).await.unwrap();
        let moved = f
            .credentials
            .reencrypt_version(&guard, &f.ctx, promoted.retiring_version, promoted.new_version, 2)
            .await
            .unwrap();
        assert_eq!(moved, 2);
        assert_readable(&f, &PROVIDERS).await;

        let report = f
            .rotation()
            .rotate(&guard, &f.ctx, &CancellationToken::new())
            .await
            .unwrap();
        drop(guard);

        assert!(report.resumed);
        assert_eq!(report.new_version, 2);
        assert_eq!(report.retired_version, 1);
        assert_eq!(report.reencrypted, 3);
        assert_eq!(f.dek.key_info(&f.ctx.tenant_id).await.unwrap().len(), 2);
        assert_eq!(f.credentials.count_on_version(&f.ctx.tenant_id, 2).await.unwrap(), 5);
        assert_readable(&f, &PROVIDERS).await;
    }

    #[tokio::test]
    async fn cancelled_before_start_changes_nothing() {
        let f = fixture(&["meta"]).await;
        let guard = f.locks.lock(&f.ctx.tenant_id).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f.rotation().rotate(&guard, &f.ctx, &cancel).await.unwrap_err();
        assert!(is_cancelled(&err));
        assert_eq!(f.dek.key_info(&f.ctx.tenant_id).await.unwrap().len(), 1);
        let s = f.metrics.snapshot();
        assert_eq!((s.rotation_successes, s.rotation_failures), (0, 0));
    }

    /// Local KMS whose wraps fail once the first `allowed` have succeeded.
    struct WrapBudget {
        inner: LocalKms,
        allowed: AtomicUsize,
    }

    #[async_trait]
    impl KmsProvider for WrapBudget {
        fn key_id(&self) -> String {
            self.inner.key_id()
        }

        async fn wrap(
            &self,
            plaintext_key: &DekBytes,
            ctx: &TenantContext,
        ) -> Result<WrappedKey, KmsError> {
            let left = self.allowed.load(Ordering::SeqCst);
            if left == 0 {
                return Err(KmsError::Unavailable("throttled".into()));
            }
            self.allowed.store(left - 1, Ordering::SeqCst);
            self.inner.wrap(plaintext_key, ctx).await
        }

        async fn unwrap(
            &self,
            wrapped: &WrappedKey,
            ctx: &TenantContext,
        ) -> Result<DekBytes, KmsError> {
            self.inner.unwrap(wrapped, ctx).await
        }
    }

    #[tokio::test]
    async fn wrap_failure_leaves_no_partial_version() {
        let kms = WrapBudget {
            inner: LocalKms::new("local-dev", DekBytes::generate()),
            allowed: AtomicUsize::new(1),
        };
        let f = fixture_with(Arc::new(kms), &["meta"]).await;
        let guard = f.locks.lock(&f.ctx.tenant_id).await;
        let err = f
            .rotation()
            .rotate(&guard, &f.ctx, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<DekError>(),
            Some(DekError::Kms(KmsError::Unavailable(_)))
        ));
        let keys = f.dek.key_info(&f.ctx.tenant_id).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].state, KeyState::Active);
        assert_eq!(f.metrics.snapshot().rotation_failures, 1);
        assert_readable(&f, &["meta"]).await;
    }

    #[tokio::test]
    async fn rotation_without_credentials_still_retires() {
        let f = fixture(&[]).await;
        let guard = f.locks.lock(&f.ctx.tenant_id).await;
        let report = f
            .rotation()
            .rotate(&guard, &f.ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.reencrypted, 0);
        assert_eq!(f.dek.retiring_version(&f.ctx.tenant_id).await.unwrap(), None);
    }
}
