//! Snapshot generation: the canonical consumer of stored credentials.
//!
//! A `snapshot.generate` task decrypts the tenant's credentials for one
//! source, fetches records through that source's [`SourceAdapter`],
//! aggregates them, persists the result through a [`SnapshotSink`] and
//! records a [`Snapshot`]. Snapshots are superseded by later ones, never
//! mutated.

pub mod adapter;
pub mod sink;
pub mod task;

pub use adapter::{AdapterError, Credentials, DateRange, SourceAdapter};
pub use sink::{build_sink, MemorySink, S3Sink, SinkError, SnapshotSink};
pub use task::{SnapshotTask, SNAPSHOT_TASK};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use common::model::Snapshot;
use common::TenantId;
use serde::Serialize;
use tokio::sync::RwLock;

/// Record count plus per-field sums of numeric values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregate {
    pub record_count: usize,
    pub totals: BTreeMap<String, f64>,
}

/// Sum every numeric top-level field across `records`.
pub fn aggregate(records: &[serde_json::Value]) -> Aggregate {
    let mut totals = BTreeMap::new();
    for record in records {
        let Some(fields) = record.as_object() else {
            continue;
        };
        for (name, value) in fields {
            if let Some(n) = value.as_f64() {
                *totals.entry(name.clone()).or_insert(0.0) += n;
            }
        }
    }
    Aggregate {
        record_count: records.len(),
        totals,
    }
}

/// Tenant-scoped history of generated snapshots.
#[derive(Clone, Default)]
pub struct SnapshotStore {
    inner: Arc<RwLock<HashMap<TenantId, Vec<Snapshot>>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, snapshot: Snapshot) {
        self.inner
            .write()
            .await
            .entry(snapshot.tenant_id.clone())
            .or_default()
            .push(snapshot);
    }

    /// Most recent snapshot for the tenant, optionally for one source.
    pub async fn latest(&self, tenant_id: &TenantId, source: Option<&str>) -> Option<Snapshot> {
        let inner = self.inner.read().await;
        inner
            .get(tenant_id)?
            .iter()
            .filter(|s| source.map_or(true, |src| s.source == src))
            .max_by_key(|s| s.generated_at)
            .cloned()
    }

    /// Every snapshot for the tenant, oldest first.
    pub async fn list(&self, tenant_id: &TenantId) -> Vec<Snapshot> {
        let inner = self.inner.read().await;
        inner.get(tenant_id).cloned().unwrap_or_default()
    }
}
