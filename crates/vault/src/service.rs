//! Service assembly, shared by the `vault` binary and embedding deployments.
//!
//! Startup sequence of [`run`]:
//! 1. Initialise AWS SDK clients when a backend needs them.
//! 2. Open the key, credential and task repositories.
//! 3. Build the KMS provider, DEK manager and credential store.
//! 4. Register task types and start the orchestrator's worker pool.
//! 5. Spawn the rotation scheduler.
//! 6. Serve the operator endpoint until Ctrl-C, then shut down in order.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aws::AwsClients;
use crate::config::Config;
use crate::credentials::{CredentialRepository, CredentialStore, CredentialTable};
use crate::dek::{DekManager, KeyRepository, KeyRotation, KeyStore, TenantLocks};
use crate::kms::{self, KmsBackend, KmsSettings};
use crate::scheduler::{RotationScheduler, RotationTask, ROTATION_TASK};
use crate::server::{self, AppState};
use crate::snapshot::{self, SnapshotStore, SnapshotTask, SourceAdapter, SNAPSHOT_TASK};
use crate::storage::StorageError;
use crate::tasks::{Orchestrator, OrchestratorSettings, TaskLedger, TaskRegistry};
use crate::telemetry::Metrics;

const COMPONENT: &str = "service";

/// The three repositories behind the vault core.
pub struct Repositories {
    pub keys: Arc<dyn KeyRepository>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub ledger: TaskLedger,
}

impl Repositories {
    /// In-memory repositories, or JSON files under `state_dir` when given.
    ///
    /// # Errors
    ///
    /// Fails if an existing state file cannot be read or does not parse.
    pub async fn open(state_dir: Option<&Path>) -> Result<Self, StorageError> {
        let Some(dir) = state_dir else {
            return Ok(Self {
                keys: Arc::new(KeyStore::new()),
                credentials: Arc::new(CredentialTable::new()),
                ledger: TaskLedger::new(),
            });
        };
        info!(component = COMPONENT, state_dir = %dir.display(), "opening persistent state");
        Ok(Self {
            keys: Arc::new(KeyStore::open(dir.join("keys.json")).await?),
            credentials: Arc::new(CredentialTable::open(dir.join("credentials.json")).await?),
            ledger: TaskLedger::open(dir.join("tasks.json")).await?,
        })
    }
}

/// Task types this service runs. `snapshot.generate` is only registered
/// when there is a snapshot handler, i.e. at least one source adapter.
pub fn build_registry(rotation: KeyRotation, snapshots: Option<SnapshotTask>) -> Result<TaskRegistry> {
    let registry = TaskRegistry::new();
    registry.register(ROTATION_TASK, Arc::new(RotationTask::new(rotation)))?;
    match snapshots {
        Some(task) => registry.register(SNAPSHOT_TASK, Arc::new(task))?,
        None => info!(
            component = COMPONENT,
            task_type = SNAPSHOT_TASK,
            "no source adapters supplied; snapshot task not registered"
        ),
    }
    Ok(registry)
}

/// Run the vault until Ctrl-C.
///
/// `adapters` are the snapshot sources this deployment can fetch from.
pub async fn run(cfg: Config, adapters: Vec<Arc<dyn SourceAdapter>>) -> Result<()> {
    let metrics = Metrics::new();

    // 1. AWS clients
    let kms_settings = KmsSettings::from_config(&cfg)?;
    let aws = if kms_settings.backend == KmsBackend::Aws || cfg.snapshot_bucket.is_some() {
        Some(AwsClients::init(kms_settings.endpoint_url.as_deref()).await)
    } else {
        None
    };

    // 2. Repositories
    let repos = Repositories::open(cfg.state_dir().as_deref())
        .await
        .context("failed to open vault state")?;

    // 3. Keys and credentials
    let kms = kms::build_provider(&kms_settings, aws.as_ref(), metrics.clone())
        .context("failed to build KMS provider")?;
    let locks = TenantLocks::new();
    let dek = DekManager::with_repository(kms, repos.keys);
    let credentials = CredentialStore::with_repository(dek.clone(), locks.clone(), repos.credentials);

    // 4. Task orchestrator
    let rotation = KeyRotation::new(dek.clone(), credentials.clone(), metrics.clone());
    let snapshots = (!adapters.is_empty()).then(|| {
        adapters.into_iter().fold(
            SnapshotTask::new(
                credentials,
                snapshot::build_sink(&cfg, aws.as_ref()),
                SnapshotStore::new(),
                cfg.snapshot_window_days,
            ),
            SnapshotTask::with_adapter,
        )
    });
    let registry = build_registry(rotation, snapshots)?;

    let orchestrator = Orchestrator::with_ledger(
        OrchestratorSettings::from_config(&cfg),
        registry,
        locks,
        metrics.clone(),
        repos.ledger,
    );
    orchestrator.start().await;

    // 5. Rotation scheduler
    let shutdown = CancellationToken::new();
    let scheduler = RotationScheduler::from_config(&cfg, dek.clone(), orchestrator.clone())
        .spawn(shutdown.child_token());

    // 6. Operator endpoint
    let state = AppState::new(orchestrator.clone(), dek, metrics);
    let server = tokio::spawn(server::serve(state, cfg.ops_port, shutdown.child_token()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    shutdown.cancel();
    if let Err(e) = scheduler.await {
        warn!(error = %e, "rotation scheduler ended abnormally");
    }
    orchestrator.shutdown().await;
    match server.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "operator endpoint ended abnormally"),
    }

    info!("vault stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{TenantContext, TenantId};

    use crate::crypto::DekBytes;
    use crate::kms::LocalKms;
    use crate::snapshot::adapter::MockSourceAdapter;
    use crate::snapshot::MemorySink;

    fn stack() -> (KeyRotation, CredentialStore) {
        let kms = Arc::new(LocalKms::new("local-dev", DekBytes::generate()));
        let dek = DekManager::new(kms, KeyStore::new());
        let credentials = CredentialStore::new(dek.clone(), TenantLocks::new());
        let rotation = KeyRotation::new(dek, credentials.clone(), Metrics::new());
        (rotation, credentials)
    }

    #[test]
    fn snapshot_task_needs_an_adapter() {
        let (rotation, _) = stack();
        let registry = build_registry(rotation, None).unwrap();
        assert!(registry.contains(ROTATION_TASK));
        assert!(!registry.contains(SNAPSHOT_TASK));

        let (rotation, credentials) = stack();
        let mut adapter = MockSourceAdapter::new();
        adapter.expect_source().return_const("meta".to_owned());
        let task = SnapshotTask::new(credentials, Arc::new(MemorySink::new()), SnapshotStore::new(), 30)
            .with_adapter(Arc::new(adapter));
        let registry = build_registry(rotation, Some(task)).unwrap();
        assert!(registry.contains(SNAPSHOT_TASK));
    }

    #[tokio::test]
    async fn state_dir_keeps_tenants_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TenantContext::fresh(TenantId::parse("t1").unwrap());
        {
            let repos = Repositories::open(Some(dir.path())).await.unwrap();
            let kms = Arc::new(LocalKms::new("local-dev", DekBytes::generate()));
            DekManager::with_repository(kms, repos.keys).onboard(&ctx).await.unwrap();
        }
        assert!(dir.path().join("keys.json").exists());

        let repos = Repositories::open(Some(dir.path())).await.unwrap();
        assert!(repos.keys.contains(&ctx.tenant_id).await.unwrap());
    }

    #[tokio::test]
    async fn no_state_dir_means_memory_only() {
        let repos = Repositories::open(None).await.unwrap();
        assert!(repos.keys.tenants().await.unwrap().is_empty());
        assert_eq!(repos.ledger.pending_count().await.unwrap(), 0);
    }
}
