//! Periodic DEK rotation.
//!
//! On every tick the scheduler submits a `dek.rotate` task for each tenant
//! whose active key has outlived the rotation interval, and for each tenant
//! an earlier rotation left unfinished. Submission goes through
//! [`Orchestrator::submit_unique`], so a tenant never has two rotations
//! scheduled or running.

pub mod task;

pub use task::{request_rotation, RotationTask, ROTATION_TASK};

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::TenantContext;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dek::DekManager;
use crate::tasks::{Orchestrator, SubmitError};

const COMPONENT: &str = "rotation_scheduler";

/// What one scheduler pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerTick {
    pub due: usize,
    pub submitted: usize,
    pub already_pending: usize,
}

pub struct RotationScheduler {
    dek: DekManager,
    orchestrator: Orchestrator,
    rotation_interval: Duration,
    check_interval: Duration,
}

impl RotationScheduler {
    pub fn new(
        dek: DekManager,
        orchestrator: Orchestrator,
        rotation_interval: Duration,
        check_interval: Duration,
    ) -> Self {
        Self {
            dek,
            orchestrator,
            rotation_interval,
            check_interval,
        }
    }

    pub fn from_config(cfg: &Config, dek: DekManager, orchestrator: Orchestrator) -> Self {
        Self::new(
            dek,
            orchestrator,
            cfg.rotation_interval(),
            cfg.rotation_check_interval(),
        )
    }

    /// Submit rotations for every tenant due at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> SchedulerTick {
        let mut due = self
            .dek
            .tenants_due_for_rotation(now, self.rotation_interval)
            .await;
        for tenant_id in self.dek.unfinished_rotations().await {
            if !due.contains(&tenant_id) {
                due.push(tenant_id);
            }
        }

        let mut tick = SchedulerTick {
            due: due.len(),
            ..SchedulerTick::default()
        };
        for tenant_id in due {
            let ctx = TenantContext::fresh(tenant_id);
            match request_rotation(&self.orchestrator, &ctx).await {
                Ok(task_id) => {
                    tick.submitted += 1;
                    info!(
                        tenant_id = %ctx.tenant_id,
                        correlation_id = %ctx.correlation_id,
                        component = COMPONENT,
                        task_id = %task_id,
                        "rotation submitted"
                    );
                }
                Err(SubmitError::AlreadyPending(existing)) => {
                    tick.already_pending += 1;
                    debug!(
                        tenant_id = %ctx.tenant_id,
                        correlation_id = %ctx.correlation_id,
                        component = COMPONENT,
                        task_id = %existing,
                        "rotation already pending"
                    );
                }
                Err(e) => warn!(
                    tenant_id = %ctx.tenant_id,
                    correlation_id = %ctx.correlation_id,
                    component = COMPONENT,
                    error = %e,
                    "failed to submit rotation; retrying next tick"
                ),
            }
        }
        tick
    }

    /// Run [`RotationScheduler::run_once`] every check interval until
    /// `shutdown` fires. The first pass happens one interval after start.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.check_interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let tick = self.run_once(Utc::now()).await;
                        if tick.due > 0 {
                            info!(
                                component = COMPONENT,
                                due = tick.due as u64,
                                submitted = tick.submitted as u64,
                                already_pending = tick.already_pending as u64,
                                "rotation check complete"
                            );
                        }
                    }
                }
            }
            debug!(component = COMPONENT, "scheduler stopped");
        })
    }
}
