//! Axum request handlers for the operator endpoint.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::protocol::{
    ErrorResponse, HealthResponse, RotationSubmitted, TaskListResponse, TaskStatusResponse,
};
use common::{ServiceError, TaskId, TenantContext, TenantId};
use tracing::{info, warn};

use super::state::AppState;
use crate::scheduler::request_rotation;
use crate::storage::StorageError;
use crate::tasks::SubmitError;

const COMPONENT: &str = "ops_server";

/// `GET /health`: 200 while the worker pool runs, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> Response {
    let workers_running = state.orchestrator.is_running();
    let ledger = state.orchestrator.ledger();
    let counts = match (ledger.pending_count().await, ledger.dead_letters().await) {
        (Ok(pending), Ok(dead)) => Some((pending, dead.len())),
        (Err(e), _) | (_, Err(e)) => {
            warn!(component = COMPONENT, error = %e, "task ledger unreadable");
            None
        }
    };
    let healthy = workers_running && counts.is_some();
    let (pending_tasks, dead_letters) = counts.unwrap_or_default();
    let body = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.into(),
        workers_running,
        pending_tasks,
        dead_letters,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// `GET /metrics`: the process-local counters.
pub async fn metrics(State(state): State<AppState>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}

/// `GET /tasks/{task_id}`: every attempt of one task.
pub async fn task_status(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let Some(task_id) = TaskId::parse(&raw) else {
        return error_response(&ServiceError::BadRequest("malformed task id".into()));
    };
    let attempts = match state.orchestrator.ledger().history(&task_id).await {
        Ok(attempts) => attempts,
        Err(e) => return ledger_unavailable(&e),
    };
    let Some(latest) = attempts.last() else {
        return error_response(&ServiceError::NotFound("task".into()));
    };
    let body = TaskStatusResponse {
        task_id,
        status: latest.status,
        attempts,
    };
    Json(body).into_response()
}

/// `GET /tenants/{tenant_id}/tasks`: latest record of each of the tenant's tasks.
pub async fn tenant_tasks(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let tenant_id = match TenantId::parse(raw) {
        Ok(t) => t,
        Err(e) => return error_response(&ServiceError::BadRequest(e.to_string())),
    };
    let tasks = match state.orchestrator.ledger().list_for_tenant(&tenant_id).await {
        Ok(tasks) => tasks,
        Err(e) => return ledger_unavailable(&e),
    };
    Json(TaskListResponse { tasks }).into_response()
}

/// `GET /dead-letters`: tasks awaiting operator attention.
pub async fn dead_letters(State(state): State<AppState>) -> Response {
    let tasks = match state.orchestrator.ledger().dead_letters().await {
        Ok(tasks) => tasks,
        Err(e) => return ledger_unavailable(&e),
    };
    Json(TaskListResponse { tasks }).into_response()
}

/// `POST /tenants/{tenant_id}/rotate`: 202 with the task id, 409 while a
/// rotation is already pending.
pub async fn rotate(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let tenant_id = match TenantId::parse(raw) {
        Ok(t) => t,
        Err(e) => return error_response(&ServiceError::BadRequest(e.to_string())),
    };
    match state.dek.key_info(&tenant_id).await {
        Ok(keys) if keys.is_empty() => {
            return error_response(&ServiceError::NotFound("tenant".into()))
        }
        Ok(_) => {}
        Err(e) => {
            warn!(
                tenant_id = %tenant_id,
                component = COMPONENT,
                error = %e,
                "key lookup failed"
            );
            return error_response(&ServiceError::Unavailable("key storage".into()));
        }
    }

    let ctx = TenantContext::fresh(tenant_id);
    match request_rotation(&state.orchestrator, &ctx).await {
        Ok(task_id) => {
            info!(
                tenant_id = %ctx.tenant_id,
                correlation_id = %ctx.correlation_id,
                component = COMPONENT,
                task_id = %task_id,
                "manual rotation requested"
            );
            (StatusCode::ACCEPTED, Json(RotationSubmitted { task_id })).into_response()
        }
        Err(SubmitError::AlreadyPending(existing)) => error_response(&ServiceError::Conflict(
            format!("rotation {existing} is already pending"),
        )),
        Err(e) => {
            warn!(
                tenant_id = %ctx.tenant_id,
                correlation_id = %ctx.correlation_id,
                component = COMPONENT,
                error = %e,
                "manual rotation refused"
            );
            error_response(&ServiceError::Unavailable(e.to_string()))
        }
    }
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

fn error_response(err: &ServiceError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse::from(err))).into_response()
}

fn ledger_unavailable(err: &StorageError) -> Response {
    warn!(component = COMPONENT, error = %err, "task ledger unreadable");
    error_response(&ServiceError::Unavailable("task ledger".into()))
}
