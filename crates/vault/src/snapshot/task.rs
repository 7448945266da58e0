//! `snapshot.generate`: decrypt, fetch, aggregate, persist.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use common::model::Snapshot;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{aggregate, Credentials, DateRange, SnapshotSink, SnapshotStore, SourceAdapter};
use crate::credentials::CredentialStore;
use crate::tasks::{TaskContext, TaskError, TaskHandler};

pub const SNAPSHOT_TASK: &str = "snapshot.generate";

const COMPONENT: &str = "snapshot_generator";

#[derive(Debug, Deserialize)]
struct SnapshotPayload {
    source: String,
    #[serde(default)]
    days: Option<u32>,
}

/// Handler for [`SNAPSHOT_TASK`]. Read-only with respect to keys.
pub struct SnapshotTask {
    credentials: CredentialStore,
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
    sink: Arc<dyn SnapshotSink>,
    snapshots: SnapshotStore,
    window_days: u32,
}

impl SnapshotTask {
    pub fn new(
        credentials: CredentialStore,
        sink: Arc<dyn SnapshotSink>,
        snapshots: SnapshotStore,
        window_days: u32,
    ) -> Self {
        Self {
            credentials,
            adapters: HashMap::new(),
            sink,
            snapshots,
            window_days,
        }
    }

    /// Register the adapter serving `adapter.source()`.
    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter.source(), adapter);
        self
    }
}

#[async_trait]
impl TaskHandler for SnapshotTask {
    async fn run(&self, ctx: &TaskContext, payload: &serde_json::Value) -> anyhow::Result<()> {
        let payload: SnapshotPayload = serde_json::from_value(payload.clone())
            .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;
        let adapter = self.adapters.get(&payload.source).ok_or_else(|| {
            TaskError::InvalidPayload(format!("no adapter for source {:?}", payload.source))
        })?;
        let tenant = ctx.tenant_context();

        let secret = self
            .credentials
            .get(&tenant, &payload.source)
            .await
            .context("resolving source credentials")?;
        ctx.ensure_not_cancelled()?;

        let generated_at = Utc::now();
        let days = payload.days.unwrap_or(self.window_days);
        let range = DateRange::last_days(generated_at, days)
            .ok_or_else(|| TaskError::InvalidPayload(format!("window of {days} days is out of range")))?;
        let records = adapter
            .fetch(&Credentials::new(payload.source.clone(), secret), range)
            .await
            .context("fetching source records")?;
        ctx.ensure_not_cancelled()?;

        let totals = aggregate(&records);
        let body = json!({
            "tenant_id": tenant.tenant_id,
            "source": payload.source,
            "generated_at": generated_at,
            "range": range,
            "record_count": totals.record_count,
            "totals": totals.totals,
        });
        let key = format!(
            "{}/{}/{}.json",
            tenant.tenant_id,
            payload.source,
            generated_at.timestamp_millis()
        );
        let payload_ref = self
            .sink
            .put(&key, serde_json::to_vec(&body)?)
            .await
            .context("persisting snapshot")?;

        self.snapshots
            .record(Snapshot {
                tenant_id: tenant.tenant_id.clone(),
                generated_at,
                source: payload.source.clone(),
                payload_ref: payload_ref.clone(),
            })
            .await;

        info!(
            tenant_id = %tenant.tenant_id,
            correlation_id = %tenant.correlation_id,
            component = COMPONENT,
            source = %payload.source,
            records = totals.record_count as u64,
            payload_ref = %payload_ref,
            "snapshot generated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use common::model::TaskStatus;
    use common::{TenantContext, TenantId};

    use crate::crypto::DekBytes;
    use crate::credentials::CredentialRepository;
    use crate::dek::{DekManager, KeyStore, TenantLocks};
    use crate::kms::LocalKms;
    use crate::snapshot::adapter::MockSourceAdapter;
    use crate::snapshot::{AdapterError, MemorySink};
    use crate::tasks::{Orchestrator, OrchestratorSettings, RetryPolicy, TaskRegistry, TaskRequest};
    use crate::telemetry::Metrics;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        orchestrator: Orchestrator,
        credentials: CredentialStore,
        snapshots: SnapshotStore,
        sink: MemorySink,
        metrics: Metrics,
    }

    async fn harness(adapter: MockSourceAdapter) -> Harness {
        let locks = TenantLocks::new();
        let kms = Arc::new(LocalKms::new("local-dev", DekBytes::generate()));
        let dek = DekManager::new(kms, KeyStore::new());
        let credentials = CredentialStore::new(dek.clone(), locks.clone());
        let snapshots = SnapshotStore::new();
        let sink = MemorySink::new();
        let metrics = Metrics::new();

        let task = SnapshotTask::new(
            credentials.clone(),
            Arc::new(sink.clone()),
            snapshots.clone(),
            30,
        )
        .with_adapter(Arc::new(adapter));
        let registry = TaskRegistry::new();
        registry.register(SNAPSHOT_TASK, Arc::new(task)).unwrap();

        let orchestrator = Orchestrator::new(
            OrchestratorSettings {
                worker_count: 2,
                queue_capacity: 16,
                retry: RetryPolicy::new(5, Duration::from_millis(1)),
                task_timeout: Duration::from_secs(5),
            },
            registry,
            locks,
            metrics.clone(),
        );
        orchestrator.start().await;

        let ctx = TenantContext::fresh(tenant());
        dek.onboard(&ctx).await.unwrap();
        credentials.put(&ctx, "meta", b"ya29.token").await.unwrap();

        Harness {
            orchestrator,
            credentials,
            snapshots,
            sink,
            metrics,
        }
    }

    fn tenant() -> TenantId {
        TenantId::parse("t1").unwrap()
    }

    fn adapter() -> MockSourceAdapter {
        let mut adapter = MockSourceAdapter::new();
        adapter.expect_source().return_const("meta".to_owned());
        adapter
    }

    async fn run(h: &Harness, payload: serde_json::Value) -> TaskStatus {
        let id = h
            .orchestrator
            .submit(TaskRequest::new(SNAPSHOT_TASK, tenant()).with_payload(payload))
            .await
            .unwrap();
        h.orchestrator.wait_for_terminal(&id, WAIT).await.unwrap()
    }

    #[tokio::test]
    async fn generates_and_records_snapshot() {
        let mut adapter = adapter();
        adapter
            .expect_fetch()
            .withf(|creds, range| {
                creds.expose() == b"ya29.token" && range.end - range.start == chrono::Duration::days(7)
            })
            .returning(|_, _| {
                Ok(vec![
                    json!({"spend": 2.5, "clicks": 4}),
                    json!({"spend": 1.5, "clicks": 6}),
                ])
            });
        let h = harness(adapter).await;

        let status = run(&h, json!({"source": "meta", "days": 7})).await;
        assert_eq!(status, TaskStatus::Succeeded);

        let snapshot = h.snapshots.latest(&tenant(), Some("meta")).await.unwrap();
        assert!(snapshot.payload_ref.starts_with("memory://t1/meta/"));
        let body: serde_json::Value =
            serde_json::from_slice(&h.sink.get(&snapshot.payload_ref).await.unwrap()).unwrap();
        assert_eq!(body["record_count"], 2);
        assert_eq!(body["totals"]["spend"], 4.0);
        assert_eq!(body["totals"]["clicks"], 10.0);
        assert!(!body.to_string().contains("ya29"));
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn adapter_outage_exhausts_retries() {
        let mut adapter = adapter();
        adapter
            .expect_fetch()
            .times(5)
            .returning(|_, _| Err(AdapterError::Unavailable("502 from upstream".into())));
        let h = harness(adapter).await;

        let status = run(&h, json!({"source": "meta"})).await;
        assert_eq!(status, TaskStatus::DeadLettered);
        let m = h.metrics.snapshot();
        assert_eq!(m.task_attempts, 5);
        assert_eq!(m.tasks_exhausted, 1);
        assert!(h.snapshots.list(&tenant()).await.is_empty());
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn missing_credentials_dead_letter_without_retry() {
        let mut adapter = MockSourceAdapter::new();
        adapter.expect_source().return_const("google_ads".to_owned());
        adapter.expect_fetch().never();
        let h = harness(adapter).await;

        let status = run(&h, json!({"source": "google_ads"})).await;
        assert_eq!(status, TaskStatus::DeadLettered);
        let m = h.metrics.snapshot();
        assert_eq!(m.task_attempts, 1);
        assert_eq!(m.tasks_exhausted, 0);
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn tampered_credential_dead_letters_on_first_attempt() {
        let mut adapter = adapter();
        adapter.expect_fetch().never();
        let h = harness(adapter).await;

        let rows = h.credentials.repository();
        let mut row = rows.load(&tenant(), "meta").await.unwrap().unwrap();
        row.tag[0] ^= 0x01;
        rows.upsert(row).await.unwrap();

        assert_eq!(run(&h, json!({"source": "meta"})).await, TaskStatus::DeadLettered);
        let m = h.metrics.snapshot();
        assert_eq!(m.task_attempts, 1);
        assert_eq!((m.tasks_dead_lettered, m.tasks_exhausted), (1, 0));
        assert!(h.snapshots.list(&tenant()).await.is_empty());
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_window_is_invalid_payload() {
        let mut adapter = adapter();
        adapter.expect_fetch().never();
        let h = harness(adapter).await;

        let status = run(&h, json!({"source": "meta", "days": u32::MAX})).await;
        assert_eq!(status, TaskStatus::DeadLettered);
        let m = h.metrics.snapshot();
        assert_eq!((m.task_attempts, m.tasks_exhausted), (1, 0));
        h.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_source_is_invalid_payload() {
        let mut adapter = adapter();
        adapter.expect_fetch().never();
        let h = harness(adapter).await;

        assert_eq!(run(&h, json!({"source": "tiktok"})).await, TaskStatus::DeadLettered);
        assert_eq!(run(&h, json!({"days": 3})).await, TaskStatus::DeadLettered);
        assert_eq!(h.metrics.snapshot().task_attempts, 2);
        assert!(h.credentials.providers(&tenant()).await.unwrap().contains(&"meta".to_owned()));
        h.orchestrator.shutdown().await;
    }
}
