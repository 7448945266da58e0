//! Execution context handed to a task handler for one attempt.

use common::{CorrelationId, TaskId, TenantContext, TenantId};
use tokio_util::sync::CancellationToken;

use super::{Orchestrator, SubmitError, TaskError, TaskRequest};
use crate::dek::{DekError, TenantGuard};

/// Everything a handler needs to know about the attempt it is running.
///
/// `tenant_id` and `correlation_id` must be attached to every log line the
/// handler emits.
pub struct TaskContext {
    pub task_id: TaskId,
    pub task_type: String,
    pub tenant_id: TenantId,
    pub correlation_id: CorrelationId,
    /// 1-based.
    pub attempt: u32,
    cancel: CancellationToken,
    guard: Option<TenantGuard>,
    orchestrator: Orchestrator,
}

impl TaskContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        task_id: TaskId,
        task_type: String,
        tenant_id: TenantId,
        correlation_id: CorrelationId,
        attempt: u32,
        cancel: CancellationToken,
        guard: Option<TenantGuard>,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            task_id,
            task_type,
            tenant_id,
            correlation_id,
            attempt,
            cancel,
            guard,
            orchestrator,
        }
    }

    pub fn tenant_context(&self) -> TenantContext {
        TenantContext::new(self.tenant_id.clone(), self.correlation_id)
    }

    /// The tenant lock, held for handlers that mutate keys.
    pub fn guard(&self) -> Option<&TenantGuard> {
        self.guard.as_ref()
    }

    /// The tenant lock, or a policy violation if the handler runs without it.
    pub fn require_guard(&self) -> Result<&TenantGuard, DekError> {
        self.guard.as_ref().ok_or_else(|| {
            DekError::PolicyViolation(format!(
                "task type {} mutates keys without holding the tenant lock",
                self.task_type
            ))
        })
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(TaskError::Cancelled)` once cancellation has been requested.
    /// Handlers call this between units of work.
    pub fn ensure_not_cancelled(&self) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        Ok(())
    }

    /// Submit a follow-up task that shares this task's correlation id.
    pub async fn submit_nested(&self, request: TaskRequest) -> Result<TaskId, SubmitError> {
        let request = request.with_correlation_id(self.correlation_id);
        self.orchestrator.submit(request).await
    }
}
