//! Axum router construction.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use super::{handlers, middleware, state::AppState};

/// Build the operator [`Router`] with all routes and middleware attached.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/tasks/:task_id", get(handlers::task_status))
        .route("/tenants/:tenant_id/tasks", get(handlers::tenant_tasks))
        .route("/tenants/:tenant_id/rotate", post(handlers::rotate))
        .route("/dead-letters", get(handlers::dead_letters))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(middleware::REQUEST_TIMEOUT))
        .with_state(state)
}
