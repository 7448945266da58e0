//! Tenant-aware asynchronous task execution.
//!
//! Work is submitted as a [`TaskRequest`] naming a registered task type. The
//! [`Orchestrator`] runs it on a worker pool, threading the tenant and
//! correlation ids through a [`TaskContext`], retrying transient failures with
//! exponential backoff and dead-lettering tasks that fail fatally or run out
//! of attempts. Every attempt is recorded in the [`TaskLedger`].
//!
//! Execution is at-least-once: handlers must tolerate being re-run.

pub mod context;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod registry;
pub mod retry;

pub use context::TaskContext;
pub use error::{classify, FailureClass, SubmitError, TaskError};
pub use ledger::{ExecutionTable, TaskLedger, TaskRepository};
pub use orchestrator::{CancelOutcome, Orchestrator, OrchestratorSettings};
pub use registry::TaskRegistry;
pub use retry::RetryPolicy;

use async_trait::async_trait;
use common::{CorrelationId, TenantId};

/// A unit of work the orchestrator knows how to run.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Whether the task changes key or credential rows. Such tasks run while
    /// holding the tenant lock, available as [`TaskContext::guard`].
    fn mutates_keys(&self) -> bool {
        false
    }

    /// Whether a timed-out attempt may be retried.
    fn idempotent(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &TaskContext, payload: &serde_json::Value) -> anyhow::Result<()>;
}

/// A request to run a registered task type for one tenant.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_type: String,
    pub tenant_id: TenantId,
    /// Generated when absent.
    pub correlation_id: Option<CorrelationId>,
    /// Falls back to the orchestrator's default.
    pub max_attempts: Option<u32>,
    pub payload: serde_json::Value,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, tenant_id: TenantId) -> Self {
        Self {
            task_type: task_type.into(),
            tenant_id,
            correlation_id: None,
            max_attempts: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}
