//! Shared state injected into every operator handler.

use crate::dek::DekManager;
use crate::tasks::Orchestrator;
use crate::telemetry::Metrics;

/// Cheaply cloneable; every field is `Arc`-backed.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    /// Used to refuse rotations for tenants that were never onboarded.
    pub dek: DekManager,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, dek: DekManager, metrics: Metrics) -> Self {
        Self {
            orchestrator,
            dek,
            metrics,
        }
    }
}
