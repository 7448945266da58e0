//! Per-attempt execution history.
//!
//! Each attempt of a task is one [`TaskExecution`] record. Records are only
//! appended or advanced out of `scheduled`/`running`; once a record reaches
//! `failed` or a terminal status it never changes again.
//!
//! [`TaskLedger`] answers the orchestrator's and operators' questions on top
//! of a [`TaskRepository`]. [`ExecutionTable`] is the in-memory repository,
//! optionally written through to a JSON file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::model::{TaskExecution, TaskStatus};
use common::{TaskId, TenantId};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::storage::{StateCell, StorageError};

/// Summary recorded on attempts a previous process left pending.
pub const INTERRUPTED_SUMMARY: &str = "interrupted: process restarted";

/// Backoff chosen after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub delay_ms: u64,
    pub next_retry_at: DateTime<Utc>,
}

/// Durable storage of [`TaskExecution`] records.
///
/// Every write is atomic with respect to the checks it documents.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Append a `scheduled` record for the next attempt of a task.
    ///
    /// Ignored unless `record.attempt` is greater than every earlier attempt
    /// and the previous record has failed.
    async fn append(&self, record: TaskExecution) -> Result<bool, StorageError>;

    /// Record a first attempt unless a task of the same type is already
    /// pending for the tenant. Returns that task's id when refused.
    async fn append_unique(&self, record: TaskExecution) -> Result<Option<TaskId>, StorageError>;

    /// Move the latest attempt from `scheduled` to `running`.
    async fn start(&self, task_id: &TaskId) -> Result<Option<TaskExecution>, StorageError>;

    /// Close the latest attempt with `status` if it is still pending.
    async fn finish(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        error_summary: Option<String>,
        retry: Option<RetrySchedule>,
    ) -> Result<bool, StorageError>;

    /// Cancel the latest attempt only while it is still `scheduled`.
    async fn revoke_scheduled(&self, task_id: &TaskId) -> Result<bool, StorageError>;

    /// Every attempt of the task, oldest first.
    async fn history(&self, task_id: &TaskId) -> Result<Vec<TaskExecution>, StorageError>;

    /// Latest attempt of every task, in submission order.
    async fn latest_all(&self) -> Result<Vec<TaskExecution>, StorageError>;

    /// Cancel every pending attempt with `summary`. Returns how many changed.
    async fn interrupt_pending(&self, summary: &str) -> Result<usize, StorageError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Executions {
    history: HashMap<TaskId, Vec<TaskExecution>>,
    /// Submission order, for stable listings.
    order: Vec<TaskId>,
}

impl Executions {
    fn last(&self, task_id: &TaskId) -> Option<&TaskExecution> {
        self.history.get(task_id).and_then(|h| h.last())
    }

    fn last_mut(&mut self, task_id: &TaskId) -> Option<&mut TaskExecution> {
        self.history.get_mut(task_id).and_then(|h| h.last_mut())
    }

    fn pending(&self, tenant_id: &TenantId, task_type: &str) -> Option<TaskId> {
        self.history.values().find_map(|h| {
            h.last()
                .filter(|r| {
                    r.status.is_pending() && &r.tenant_id == tenant_id && r.task_type == task_type
                })
                .map(|r| r.task_id)
        })
    }

    fn insert_first(&mut self, record: TaskExecution) {
        let task_id = record.task_id;
        self.history.insert(task_id, vec![record]);
        self.order.push(task_id);
    }
}

/// [`TaskRepository`] held in memory, optionally written through to a JSON
/// file.
#[derive(Clone)]
pub struct ExecutionTable {
    cell: Arc<StateCell<Executions>>,
}

impl Default for ExecutionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTable {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(StateCell::memory()),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Ok(Self {
            cell: Arc::new(StateCell::open(path).await?),
        })
    }
}

#[async_trait]
impl TaskRepository for ExecutionTable {
    async fn append(&self, record: TaskExecution) -> Result<bool, StorageError> {
        self.cell
            .mutate(|state| {
                let accepts = state.last(&record.task_id).map_or(true, |prev| {
                    prev.status == TaskStatus::Failed && prev.attempt < record.attempt
                });
                if !accepts {
                    return Ok(false);
                }
                match state.history.get_mut(&record.task_id) {
                    Some(history) => history.push(record),
                    None => state.insert_first(record),
                }
                Ok(true)
            })
            .await
    }

    async fn append_unique(&self, record: TaskExecution) -> Result<Option<TaskId>, StorageError> {
        self.cell
            .mutate(|state| {
                if let Some(existing) = state.pending(&record.tenant_id, &record.task_type) {
                    return Ok(Some(existing));
                }
                state.insert_first(record);
                Ok(None)
            })
            .await
    }

    async fn start(&self, task_id: &TaskId) -> Result<Option<TaskExecution>, StorageError> {
        self.cell
            .mutate(|state| {
                let Some(record) = state.last_mut(task_id) else {
                    return Ok(None);
                };
                if record.status != TaskStatus::Scheduled {
                    return Ok(None);
                }
                record.status = TaskStatus::Running;
                record.started_at = Some(Utc::now());
                Ok(Some(record.clone()))
            })
            .await
    }

    async fn finish(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        error_summary: Option<String>,
        retry: Option<RetrySchedule>,
    ) -> Result<bool, StorageError> {
        self.cell
            .mutate(|state| {
                let Some(record) = state.last_mut(task_id) else {
                    return Ok(false);
                };
                if !record.status.is_pending() {
                    return Ok(false);
                }
                close(record, status, error_summary);
                if let Some(retry) = retry {
                    record.retry_delay_ms = Some(retry.delay_ms);
                    record.next_retry_at = Some(retry.next_retry_at);
                }
                Ok(true)
            })
            .await
    }

    async fn revoke_scheduled(&self, task_id: &TaskId) -> Result<bool, StorageError> {
        self.cell
            .mutate(|state| {
                let Some(record) = state.last_mut(task_id) else {
                    return Ok(false);
                };
                if record.status != TaskStatus::Scheduled {
                    return Ok(false);
                }
                close(record, TaskStatus::Cancelled, None);
                Ok(true)
            })
            .await
    }

    async fn history(&self, task_id: &TaskId) -> Result<Vec<TaskExecution>, StorageError> {
        let state = self.cell.read().await;
        Ok(state.history.get(task_id).cloned().unwrap_or_default())
    }

    async fn latest_all(&self) -> Result<Vec<TaskExecution>, StorageError> {
        let state = self.cell.read().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.last(id))
            .cloned()
            .collect())
    }

    async fn interrupt_pending(&self, summary: &str) -> Result<usize, StorageError> {
        self.cell
            .mutate(|state| {
                let mut interrupted = 0;
                for record in state.history.values_mut().filter_map(|h| h.last_mut()) {
                    if record.status.is_pending() {
                        close(record, TaskStatus::Cancelled, Some(summary.to_owned()));
                        interrupted += 1;
                    }
                }
                Ok(interrupted)
            })
            .await
    }
}

fn close(record: &mut TaskExecution, status: TaskStatus, error_summary: Option<String>) {
    record.status = status;
    record.finished_at = Some(Utc::now());
    record.error_summary = error_summary;
}

/// Append-only store of [`TaskExecution`] records.
#[derive(Clone)]
pub struct TaskLedger {
    repo: Arc<dyn TaskRepository>,
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskLedger {
    /// A ledger that lives only as long as the process.
    pub fn new() -> Self {
        Self::with_repository(Arc::new(ExecutionTable::new()))
    }

    pub fn with_repository(repo: Arc<dyn TaskRepository>) -> Self {
        Self { repo }
    }

    /// A ledger persisted to `path`.
    ///
    /// Attempts a previous process left `scheduled` or `running` can never
    /// complete; they are closed as cancelled with [`INTERRUPTED_SUMMARY`] so
    /// they stop blocking unique submissions.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let table = ExecutionTable::open(path).await?;
        let interrupted = table.interrupt_pending(INTERRUPTED_SUMMARY).await?;
        if interrupted > 0 {
            warn!(
                component = "task_ledger",
                interrupted = interrupted as u64,
                "closed attempts left pending by a previous process"
            );
        }
        Ok(Self::with_repository(Arc::new(table)))
    }

    pub async fn schedule(&self, record: TaskExecution) -> Result<bool, StorageError> {
        self.repo.append(record).await
    }

    /// Record the first attempt unless a task of the same type is already
    /// pending for the tenant, in which case that task's id is returned.
    pub async fn schedule_unique(
        &self,
        record: TaskExecution,
    ) -> Result<Result<(), TaskId>, StorageError> {
        Ok(match self.repo.append_unique(record).await? {
            Some(existing) => Err(existing),
            None => Ok(()),
        })
    }

    /// Move the current attempt from `scheduled` to `running`.
    ///
    /// Returns the updated record, or `None` if the attempt is no longer
    /// scheduled (e.g. it was cancelled).
    pub async fn start(&self, task_id: &TaskId) -> Result<Option<TaskExecution>, StorageError> {
        self.repo.start(task_id).await
    }

    /// Close the current attempt with `status`.
    ///
    /// Returns `false` without changing anything if the attempt was already
    /// closed.
    pub async fn finish(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        error_summary: Option<String>,
        retry: Option<RetrySchedule>,
    ) -> Result<bool, StorageError> {
        self.repo.finish(task_id, status, error_summary, retry).await
    }

    /// Cancel the current attempt if, and only if, it has not started.
    pub async fn revoke_scheduled(&self, task_id: &TaskId) -> Result<bool, StorageError> {
        self.repo.revoke_scheduled(task_id).await
    }

    /// Status of the task's latest attempt.
    pub async fn status(&self, task_id: &TaskId) -> Result<Option<TaskStatus>, StorageError> {
        Ok(self.latest(task_id).await?.map(|r| r.status))
    }

    pub async fn latest(&self, task_id: &TaskId) -> Result<Option<TaskExecution>, StorageError> {
        Ok(self.repo.history(task_id).await?.pop())
    }

    /// Every attempt of the task, oldest first.
    pub async fn history(&self, task_id: &TaskId) -> Result<Vec<TaskExecution>, StorageError> {
        self.repo.history(task_id).await
    }

    /// Latest attempt of each of the tenant's tasks, in submission order.
    pub async fn list_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<TaskExecution>, StorageError> {
        self.latest_where(|r| &r.tenant_id == tenant_id).await
    }

    /// Latest attempt of every dead-lettered task, in submission order.
    pub async fn dead_letters(&self) -> Result<Vec<TaskExecution>, StorageError> {
        self.latest_where(|r| r.status == TaskStatus::DeadLettered).await
    }

    /// Pending task of `task_type` for the tenant, if any.
    pub async fn pending(
        &self,
        tenant_id: &TenantId,
        task_type: &str,
    ) -> Result<Option<TaskId>, StorageError> {
        Ok(self
            .latest_where(|r| {
                r.status.is_pending() && &r.tenant_id == tenant_id && r.task_type == task_type
            })
            .await?
            .first()
            .map(|r| r.task_id))
    }

    pub async fn pending_count(&self) -> Result<usize, StorageError> {
        Ok(self.latest_where(|r| r.status.is_pending()).await?.len())
    }

    async fn latest_where(
        &self,
        keep: impl Fn(&TaskExecution) -> bool,
    ) -> Result<Vec<TaskExecution>, StorageError> {
        let mut records = self.repo.latest_all().await?;
        records.retain(|r| keep(r));
        Ok(records)
    }
}

/// A fresh `scheduled` record.
pub fn scheduled_record(
    task_id: TaskId,
    task_type: &str,
    tenant_id: &TenantId,
    correlation_id: common::CorrelationId,
    attempt: u32,
    scheduled_at: DateTime<Utc>,
) -> TaskExecution {
    TaskExecution {
        task_id,
        task_type: task_type.to_owned(),
        tenant_id: tenant_id.clone(),
        correlation_id,
        attempt,
        status: TaskStatus::Scheduled,
        scheduled_at,
        started_at: None,
        finished_at: None,
        next_retry_at: None,
        retry_delay_ms: None,
        error_summary: None,
    }
}
