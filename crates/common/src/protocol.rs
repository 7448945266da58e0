//! Request and response types served by the operator endpoint.
//!
//! None of these types carry key material, ciphertext, or decrypted secrets.

use serde::{Deserialize, Serialize};

use crate::ids::TaskId;
use crate::model::{TaskExecution, TaskStatus};

// ---------------------------------------------------------------------------
// Task status
// ---------------------------------------------------------------------------

/// Response body for `GET /tasks/{task_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    /// Status of the latest attempt.
    pub status: TaskStatus,
    /// Every attempt record, oldest first.
    pub attempts: Vec<TaskExecution>,
}

/// Response body for `GET /tenants/{tenant_id}/tasks` and `GET /dead-letters`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListResponse {
    /// Latest attempt record of each matching task.
    pub tasks: Vec<TaskExecution>,
}

/// Response body for `POST /tenants/{tenant_id}/rotate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationSubmitted {
    pub task_id: TaskId,
}

// ---------------------------------------------------------------------------
// Error response
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"bad_request"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&crate::ServiceError> for ErrorResponse {
    fn from(err: &crate::ServiceError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall service status: `"ok"` or `"degraded"`.
    pub status: String,
    /// Whether the worker pool is accepting work.
    pub workers_running: bool,
    /// Number of tasks currently scheduled or running.
    pub pending_tasks: usize,
    /// Number of dead-lettered tasks awaiting operator attention.
    pub dead_letters: usize,
}
