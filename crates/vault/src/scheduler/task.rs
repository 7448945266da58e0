//! `dek.rotate`: the orchestrated form of [`KeyRotation::rotate`].

use async_trait::async_trait;
use common::{TaskId, TenantContext};

use crate::dek::KeyRotation;
use crate::tasks::{Orchestrator, SubmitError, TaskContext, TaskHandler, TaskRequest};

pub const ROTATION_TASK: &str = "dek.rotate";

/// Rotation handler. Runs under the tenant lock.
pub struct RotationTask {
    rotation: KeyRotation,
}

impl RotationTask {
    pub fn new(rotation: KeyRotation) -> Self {
        Self { rotation }
    }
}

#[async_trait]
impl TaskHandler for RotationTask {
    fn mutates_keys(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &TaskContext, _payload: &serde_json::Value) -> anyhow::Result<()> {
        let guard = ctx.require_guard()?;
        self.rotation
            .rotate(guard, &ctx.tenant_context(), ctx.cancellation_token())
            .await?;
        Ok(())
    }
}

/// Manually trigger a rotation. Refused while one is already pending for the
/// tenant.
pub async fn request_rotation(
    orchestrator: &Orchestrator,
    ctx: &TenantContext,
) -> Result<TaskId, SubmitError> {
    orchestrator
        .submit_unique(
            TaskRequest::new(ROTATION_TASK, ctx.tenant_id.clone())
                .with_correlation_id(ctx.correlation_id),
        )
        .await
}
