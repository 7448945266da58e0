//! Worker pool, retry loop, cancellation and dead-lettering.
//!
//! Each attempt runs on its own Tokio task, so a panicking handler fails that
//! attempt instead of taking a worker down with it. Workers never wait on a
//! tenant lock: a key-mutating task whose tenant is busy goes back on the
//! queue.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::model::TaskStatus;
use common::{CorrelationId, TaskId, TenantId};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::TaskContext;
use super::error::{classify, FailureClass, SubmitError, TaskError};
use super::ledger::{scheduled_record, RetrySchedule, TaskLedger};
use super::registry::TaskRegistry;
use super::retry::RetryPolicy;
use super::{TaskHandler, TaskRequest};
use crate::config::Config;
use crate::dek::TenantLocks;
use crate::storage::StorageError;
use crate::telemetry::redact::truncate_summary;
use crate::telemetry::Metrics;

const COMPONENT: &str = "orchestrator";

/// Poll interval of [`Orchestrator::wait_for_terminal`].
const WAIT_POLL: Duration = Duration::from_millis(5);

/// Delay before a key-mutating task retries a busy tenant lock.
const LOCK_BUSY_RETRY: Duration = Duration::from_millis(25);

/// Worker-pool and retry settings.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub worker_count: usize,
    pub queue_capacity: usize,
    /// Default attempt budget and backoff unit.
    pub retry: RetryPolicy,
    /// Hard wall-clock limit per attempt.
    pub task_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            worker_count: cfg.worker_count,
            queue_capacity: cfg.queue_capacity,
            retry: RetryPolicy::new(cfg.task_max_attempts, cfg.retry_unit()),
            task_timeout: cfg.task_timeout(),
        }
    }
}

/// Result of [`Orchestrator::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task had not started and will never run.
    Cancelled,
    /// The task is running; its cancellation token was triggered.
    Signalled,
    /// The task had already finished.
    AlreadyFinished,
}

/// Immutable description of a submitted task.
struct TaskDescriptor {
    task_type: String,
    tenant_id: TenantId,
    correlation_id: CorrelationId,
    max_attempts: u32,
    payload: serde_json::Value,
}

#[derive(Clone)]
struct Job {
    desc: Arc<TaskDescriptor>,
    cancel: CancellationToken,
}

struct Inner {
    settings: OrchestratorSettings,
    registry: TaskRegistry,
    ledger: TaskLedger,
    locks: TenantLocks,
    metrics: Metrics,
    jobs: Mutex<HashMap<TaskId, Job>>,
    queue: mpsc::Sender<TaskId>,
    receiver: Mutex<mpsc::Receiver<TaskId>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

/// Cheaply cloneable handle to the task system.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator with an in-memory ledger. No work runs until
    /// [`Orchestrator::start`].
    pub fn new(
        settings: OrchestratorSettings,
        registry: TaskRegistry,
        locks: TenantLocks,
        metrics: Metrics,
    ) -> Self {
        Self::with_ledger(settings, registry, locks, metrics, TaskLedger::new())
    }

    pub fn with_ledger(
        settings: OrchestratorSettings,
        registry: TaskRegistry,
        locks: TenantLocks,
        metrics: Metrics,
        ledger: TaskLedger,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                settings,
                registry,
                ledger,
                locks,
                metrics,
                jobs: Mutex::new(HashMap::new()),
                queue,
                receiver: Mutex::new(receiver),
                shutdown: CancellationToken::new(),
                workers: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the worker pool. Calling this more than once has no effect.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let count = self.inner.settings.worker_count.max(1);
        let mut workers = self.inner.workers.lock().await;
        for worker in 0..count {
            let this = self.clone();
            workers.push(tokio::spawn(async move { this.worker_loop(worker).await }));
        }
        info!(
            component = COMPONENT,
            workers = count as u64,
            queue_capacity = self.inner.settings.queue_capacity as u64,
            "worker pool started"
        );
    }

    /// Stop accepting work, cancel running tasks and wait for workers to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles = std::mem::take(&mut *self.inner.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(component = COMPONENT, error = %e, "worker ended abnormally");
            }
        }
        info!(component = COMPONENT, "worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.shutdown.is_cancelled()
    }

    pub fn ledger(&self) -> &TaskLedger {
        &self.inner.ledger
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Queue a task. Returns its id once the first attempt is scheduled.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId, SubmitError> {
        let (task_id, job) = self.prepare(request)?;
        let record = first_record(task_id, &job.desc);
        self.inner.ledger.schedule(record).await?;
        self.admit(task_id, job).await
    }

    /// Like [`Orchestrator::submit`], but refuses if a task of the same type
    /// is already scheduled or running for the tenant.
    pub async fn submit_unique(&self, request: TaskRequest) -> Result<TaskId, SubmitError> {
        let (task_id, job) = self.prepare(request)?;
        let record = first_record(task_id, &job.desc);
        self.inner
            .ledger
            .schedule_unique(record)
            .await?
            .map_err(SubmitError::AlreadyPending)?;
        self.admit(task_id, job).await
    }

    /// Revoke a task that has not started, or signal a running one.
    ///
    /// Returns `None` for an unknown task id.
    pub async fn cancel(&self, task_id: &TaskId) -> Option<CancelOutcome> {
        let job = self.inner.jobs.lock().await.get(task_id).cloned();

        // Only a still-scheduled attempt is revoked; a worker that already
        // started it wins and gets signalled below instead.
        let revoked = logged(task_id, "revoke", self.inner.ledger.revoke_scheduled(task_id).await);
        if revoked {
            if let Some(job) = &job {
                job.cancel.cancel();
                self.inner.metrics.task_cancelled(&job.desc.task_type);
                info!(
                    tenant_id = %job.desc.tenant_id,
                    correlation_id = %job.desc.correlation_id,
                    component = COMPONENT,
                    task_id = %task_id,
                    task_type = %job.desc.task_type,
                    "task cancelled before running"
                );
            }
            return Some(CancelOutcome::Cancelled);
        }

        match (self.status(task_id).await?, job) {
            (status, Some(job)) if status.is_pending() => {
                job.cancel.cancel();
                info!(
                    tenant_id = %job.desc.tenant_id,
                    correlation_id = %job.desc.correlation_id,
                    component = COMPONENT,
                    task_id = %task_id,
                    task_type = %job.desc.task_type,
                    "cancellation requested for running task"
                );
                Some(CancelOutcome::Signalled)
            }
            _ => Some(CancelOutcome::AlreadyFinished),
        }
    }

    pub async fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        logged(task_id, "status", self.inner.ledger.status(task_id).await)
    }

    /// Wait until the task reaches a terminal status or `timeout` elapses.
    pub async fn wait_for_terminal(&self, task_id: &TaskId, timeout: Duration) -> Option<TaskStatus> {
        let poll = async {
            loop {
                match self.status(task_id).await {
                    Some(status) if status.is_terminal() => return Some(status),
                    None => return None,
                    _ => tokio::time::sleep(WAIT_POLL).await,
                }
            }
        };
        tokio::time::timeout(timeout, poll).await.ok().flatten()
    }

    fn prepare(&self, request: TaskRequest) -> Result<(TaskId, Job), SubmitError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        if !self.inner.registry.contains(&request.task_type) {
            warn!(
                tenant_id = %request.tenant_id,
                component = COMPONENT,
                task_type = %request.task_type,
                "rejected submission of unknown task type"
            );
            return Err(SubmitError::UnknownTaskType(request.task_type));
        }
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.inner.settings.retry.max_attempts)
            .max(1);
        let desc = TaskDescriptor {
            task_type: request.task_type,
            tenant_id: request.tenant_id,
            correlation_id: request.correlation_id.unwrap_or_default(),
            max_attempts,
            payload: request.payload,
        };
        let job = Job {
            desc: Arc::new(desc),
            cancel: self.inner.shutdown.child_token(),
        };
        Ok((TaskId::new(), job))
    }

    async fn admit(&self, task_id: TaskId, job: Job) -> Result<TaskId, SubmitError> {
        let desc = job.desc.clone();
        self.inner.jobs.lock().await.insert(task_id, job);
        if self.inner.queue.send(task_id).await.is_err() {
            logged(&task_id, "revoke", self.inner.ledger.revoke_scheduled(&task_id).await);
            self.forget(&task_id).await;
            return Err(SubmitError::ShuttingDown);
        }
        info!(
            tenant_id = %desc.tenant_id,
            correlation_id = %desc.correlation_id,
            component = COMPONENT,
            task_id = %task_id,
            task_type = %desc.task_type,
            max_attempts = desc.max_attempts,
            "task submitted"
        );
        Ok(task_id)
    }

    async fn forget(&self, task_id: &TaskId) {
        self.inner.jobs.lock().await.remove(task_id);
    }

    async fn worker_loop(self, worker: usize) {
        loop {
            let next = {
                let mut receiver = self.inner.receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = self.inner.shutdown.cancelled() => None,
                    task_id = receiver.recv() => task_id,
                }
            };
            let Some(task_id) = next else { break };
            self.execute(task_id).await;
        }
        debug!(component = COMPONENT, worker = worker as u64, "worker exiting");
    }

    async fn execute(&self, task_id: TaskId) {
        let Some(job) = self.inner.jobs.lock().await.get(&task_id).cloned() else {
            return;
        };
        let desc = job.desc.clone();

        // Cancelled between attempts, or while waiting for the tenant lock.
        if job.cancel.is_cancelled() {
            if logged(&task_id, "revoke", self.inner.ledger.revoke_scheduled(&task_id).await) {
                self.inner.metrics.task_cancelled(&desc.task_type);
            }
            self.forget(&task_id).await;
            return;
        }

        let Some(handler) = self.inner.registry.get(&desc.task_type) else {
            if logged(&task_id, "start", self.inner.ledger.start(&task_id).await).is_some() {
                let err = anyhow::Error::new(TaskError::UnknownTaskType(desc.task_type.clone()));
                self.dead_letter(&task_id, &desc, &err, FailureClass::Fatal).await;
            }
            self.forget(&task_id).await;
            return;
        };

        let guard = if handler.mutates_keys() {
            let Some(guard) = self.inner.locks.try_lock(&desc.tenant_id).await else {
                debug!(
                    tenant_id = %desc.tenant_id,
                    correlation_id = %desc.correlation_id,
                    component = COMPONENT,
                    task_id = %task_id,
                    task_type = %desc.task_type,
                    "tenant lock busy; requeued"
                );
                self.requeue_after(task_id, LOCK_BUSY_RETRY);
                return;
            };
            Some(guard)
        } else {
            None
        };

        // `None` means the attempt was cancelled while queued.
        let Some(record) = logged(&task_id, "start", self.inner.ledger.start(&task_id).await) else {
            self.forget(&task_id).await;
            return;
        };
        let attempt = record.attempt;

        self.inner.metrics.task_attempt(&desc.task_type);
        info!(
            tenant_id = %desc.tenant_id,
            correlation_id = %desc.correlation_id,
            component = COMPONENT,
            task_id = %task_id,
            task_type = %desc.task_type,
            attempt,
            "task attempt started"
        );

        let ctx = TaskContext::new(
            task_id,
            desc.task_type.clone(),
            desc.tenant_id.clone(),
            desc.correlation_id,
            attempt,
            job.cancel.clone(),
            guard,
            self.clone(),
        );
        let timeout = self.inner.settings.task_timeout;
        let run = {
            let handler = handler.clone();
            let desc = desc.clone();
            tokio::spawn(async move {
                let outcome = tokio::time::timeout(timeout, handler.run(&ctx, &desc.payload)).await;
                // Releases the tenant lock before any backoff.
                drop(ctx);
                outcome
            })
        };

        let err = match run.await {
            Ok(Ok(Ok(()))) => {
                let recorded = logged(
                    &task_id,
                    "finish",
                    self.inner
                        .ledger
                        .finish(&task_id, TaskStatus::Succeeded, None, None)
                        .await,
                );
                if recorded {
                    self.inner.metrics.task_succeeded(&desc.task_type);
                    info!(
                        tenant_id = %desc.tenant_id,
                        correlation_id = %desc.correlation_id,
                        component = COMPONENT,
                        task_id = %task_id,
                        task_type = %desc.task_type,
                        attempt,
                        "task succeeded"
                    );
                }
                self.forget(&task_id).await;
                return;
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(_)) => anyhow::Error::new(TaskError::TimedOut(timeout)),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(
                    tenant_id = %desc.tenant_id,
                    correlation_id = %desc.correlation_id,
                    component = COMPONENT,
                    task_id = %task_id,
                    task_type = %desc.task_type,
                    attempt,
                    "task handler panicked"
                );
                anyhow::Error::new(TaskError::Panicked(message))
            }
            Err(e) => anyhow::Error::new(e).context("attempt aborted"),
        };

        if job.cancel.is_cancelled() {
            let recorded = logged(
                &task_id,
                "finish",
                self.inner
                    .ledger
                    .finish(&task_id, TaskStatus::Cancelled, Some(summary("cancelled", &err)), None)
                    .await,
            );
            if recorded {
                self.inner.metrics.task_cancelled(&desc.task_type);
                info!(
                    tenant_id = %desc.tenant_id,
                    correlation_id = %desc.correlation_id,
                    component = COMPONENT,
                    task_id = %task_id,
                    task_type = %desc.task_type,
                    attempt,
                    "running task cancelled"
                );
            }
            self.forget(&task_id).await;
            return;
        }

        self.fail_attempt(task_id, &desc, attempt, &handler, err).await;
    }

    async fn fail_attempt(
        &self,
        task_id: TaskId,
        desc: &TaskDescriptor,
        attempt: u32,
        handler: &Arc<dyn TaskHandler>,
        err: anyhow::Error,
    ) {
        let class = classify(&err, handler.idempotent());
        self.inner.metrics.task_failed(&desc.task_type);

        let policy = RetryPolicy::new(desc.max_attempts, self.inner.settings.retry.unit);
        if class == FailureClass::Fatal || !policy.should_retry(attempt) {
            self.dead_letter(&task_id, desc, &err, class).await;
            self.forget(&task_id).await;
            return;
        }

        let delay = {
            let mut rng = rand::thread_rng();
            policy.delay_after(attempt, &mut rng)
        };
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let next_retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let error_summary = summary(&class.to_string(), &err);

        let recorded = logged(
            &task_id,
            "finish",
            self.inner
                .ledger
                .finish(
                    &task_id,
                    TaskStatus::Failed,
                    Some(error_summary.clone()),
                    Some(RetrySchedule {
                        delay_ms,
                        next_retry_at,
                    }),
                )
                .await,
        );
        if !recorded {
            self.forget(&task_id).await;
            return;
        }
        warn!(
            tenant_id = %desc.tenant_id,
            correlation_id = %desc.correlation_id,
            component = COMPONENT,
            task_id = %task_id,
            task_type = %desc.task_type,
            attempt,
            failure_class = %class,
            retry_delay_ms = delay_ms,
            error = %error_summary,
            "task attempt failed; retry scheduled"
        );

        let next = scheduled_record(
            task_id,
            &desc.task_type,
            &desc.tenant_id,
            desc.correlation_id,
            attempt + 1,
            next_retry_at,
        );
        if logged(&task_id, "schedule", self.inner.ledger.schedule(next).await) {
            self.requeue_after(task_id, delay);
        } else {
            self.forget(&task_id).await;
        }
    }

    async fn dead_letter(
        &self,
        task_id: &TaskId,
        desc: &TaskDescriptor,
        err: &anyhow::Error,
        class: FailureClass,
    ) {
        let error_summary = summary(&class.to_string(), err);
        let recorded = logged(
            task_id,
            "finish",
            self.inner
                .ledger
                .finish(
                    task_id,
                    TaskStatus::DeadLettered,
                    Some(error_summary.clone()),
                    None,
                )
                .await,
        );
        if !recorded {
            return;
        }
        let exhausted = class == FailureClass::Transient;
        self.inner
            .metrics
            .task_dead_lettered(&desc.task_type, exhausted);
        error!(
            tenant_id = %desc.tenant_id,
            correlation_id = %desc.correlation_id,
            component = COMPONENT,
            task_id = %task_id,
            task_type = %desc.task_type,
            failure_class = %class,
            exhausted,
            alert = true,
            error = %error_summary,
            "task dead-lettered"
        );
    }

    fn requeue_after(&self, task_id: TaskId, delay: Duration) {
        let queue = self.inner.queue.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = queue.send(task_id).await;
                }
            }
        });
    }
}

fn first_record(task_id: TaskId, desc: &TaskDescriptor) -> common::model::TaskExecution {
    scheduled_record(
        task_id,
        &desc.task_type,
        &desc.tenant_id,
        desc.correlation_id,
        1,
        Utc::now(),
    )
}

/// The ledger value on success; otherwise logs and reports "not applied".
fn logged<T: Default>(task_id: &TaskId, operation: &str, result: Result<T, StorageError>) -> T {
    result.unwrap_or_else(|e| {
        error!(
            component = COMPONENT,
            task_id = %task_id,
            operation,
            alert = true,
            error = %e,
            "task ledger unavailable"
        );
        T::default()
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// `"<class>: <error chain>"`, truncated for storage.
fn summary(class: &str, err: &anyhow::Error) -> String {
    truncate_summary(&format!("{class}: {err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::KmsError;
    use crate::snapshot::AdapterError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    fn tenant(id: &str) -> TenantId {
        TenantId::parse(id).unwrap()
    }

    fn settings(timeout: Duration) -> OrchestratorSettings {
        OrchestratorSettings {
            worker_count: 4,
            queue_capacity: 64,
            retry: RetryPolicy::new(5, Duration::from_millis(1)),
            task_timeout: timeout,
        }
    }

    async fn started(
        handlers: Vec<(&str, Arc<dyn TaskHandler>)>,
        timeout: Duration,
    ) -> Orchestrator {
        let registry = TaskRegistry::new();
        for (name, handler) in handlers {
            registry.register(name, handler).unwrap();
        }
        let orch = Orchestrator::new(
            settings(timeout),
            registry,
            TenantLocks::new(),
            Metrics::new(),
        );
        orch.start().await;
        orch
    }

    const WAIT: Duration = Duration::from_secs(5);

    fn dyn_handler<H: TaskHandler + 'static>(handler: Arc<H>) -> Arc<dyn TaskHandler> {
        handler
    }

    /// Fails with a transient adapter error `failures` times, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn run(&self, _ctx: &TaskContext, _payload: &serde_json::Value) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(AdapterError::Unavailable(format!("call {n} refused")).into());
            }
            Ok(())
        }
    }

    struct Denied;

    #[async_trait]
    impl TaskHandler for Denied {
        async fn run(&self, _ctx: &TaskContext, _payload: &serde_json::Value) -> anyhow::Result<()> {
            Err(KmsError::AccessDenied("AccessDeniedException".into()).into())
        }
    }

    struct Sleepy {
        idempotent: bool,
    }

    #[async_trait]
    impl TaskHandler for Sleepy {
        fn idempotent(&self) -> bool {
            self.idempotent
        }

        async fn run(&self, _ctx: &TaskContext, _payload: &serde_json::Value) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    /// Waits for cancellation and reports it.
    struct Cooperative;

    #[async_trait]
    impl TaskHandler for Cooperative {
        async fn run(&self, ctx: &TaskContext, _payload: &serde_json::Value) -> anyhow::Result<()> {
            ctx.cancellation_token().cancelled().await;
            ctx.ensure_not_cancelled()?;
            Ok(())
        }
    }

    /// Records the peak number of concurrently running instances.
    #[derive(Default)]
    struct Exclusive {
        running: AtomicUsize,
        peak: AtomicUsize,
        saw_guard: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Exclusive {
        fn mutates_keys(&self) -> bool {
            true
        }

        async fn run(&self, ctx: &TaskContext, _payload: &serde_json::Value) -> anyhow::Result<()> {
            if ctx.guard().is_some() {
                self.saw_guard.fetch_add(1, Ordering::SeqCst);
            }
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Ignores cancellation and finishes once released.
    struct Gated {
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl TaskHandler for Gated {
        async fn run(&self, _ctx: &TaskContext, _payload: &serde_json::Value) -> anyhow::Result<()> {
            self.release.notified().await;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Exploding {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TaskHandler for Exploding {
        fn mutates_keys(&self) -> bool {
            true
        }

        async fn run(&self, _ctx: &TaskContext, _payload: &serde_json::Value) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("handler bug");
        }
    }

    fn single_worker(registry: TaskRegistry, locks: TenantLocks) -> Orchestrator {
        let settings = OrchestratorSettings {
            worker_count: 1,
            ..settings(WAIT)
        };
        Orchestrator::new(settings, registry, locks, Metrics::new())
    }

    #[tokio::test]
    async fn successful_task_runs_once() {
        let flaky = Flaky::new(0);
        let orch = started(vec![("ok", dyn_handler(flaky.clone()))], WAIT).await;
        let id = orch.submit(TaskRequest::new("ok", tenant("t1"))).await.unwrap();

        assert_eq!(orch.wait_for_terminal(&id, WAIT).await, Some(TaskStatus::Succeeded));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
        let m = orch.metrics().snapshot();
        assert_eq!((m.task_attempts, m.task_successes, m.task_failures), (1, 1, 0));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn transient_failures_retry_with_recorded_backoff() {
        let flaky = Flaky::new(2);
        let orch = started(vec![("flaky", dyn_handler(flaky.clone()))], WAIT).await;
        let id = orch.submit(TaskRequest::new("flaky", tenant("t1"))).await.unwrap();

        assert_eq!(orch.wait_for_terminal(&id, WAIT).await, Some(TaskStatus::Succeeded));
        let history = orch.ledger().history(&id).await.unwrap();
        let attempts: Vec<_> = history.iter().map(|r| (r.attempt, r.status)).collect();
        assert_eq!(
            attempts,
            vec![
                (1, TaskStatus::Failed),
                (2, TaskStatus::Failed),
                (3, TaskStatus::Succeeded)
            ]
        );
        for failed in &history[..2] {
            assert!(failed.next_retry_at.is_some());
            let summary = failed.error_summary.as_deref().unwrap();
            assert!(summary.starts_with("transient: "), "{summary}");
        }
        assert_eq!(history[2].error_summary, None);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_task_dead_letters_after_five_attempts() {
        let flaky = Flaky::new(u32::MAX);
        let orch = started(vec![("doomed", dyn_handler(flaky.clone()))], WAIT).await;
        let id = orch.submit(TaskRequest::new("doomed", tenant("t1"))).await.unwrap();

        assert_eq!(orch.wait_for_terminal(&id, WAIT).await, Some(TaskStatus::DeadLettered));
        // No attempt follows the dead letter.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 5);

        let history = orch.ledger().history(&id).await.unwrap();
        assert_eq!(history.len(), 5);
        let last = history.last().unwrap();
        assert_eq!((last.attempt, last.status), (5, TaskStatus::DeadLettered));

        // Delay after attempt k lies in [2^(k-1), 2^k) units of 1 ms.
        for (k, record) in history[..4].iter().enumerate() {
            let base = 1u64 << k;
            let delay = record.retry_delay_ms.unwrap();
            assert!(delay >= base && delay < 2 * base, "attempt {}: {delay}", k + 1);
        }

        let m = orch.metrics().snapshot();
        assert_eq!(m.tasks_exhausted, 1);
        assert_eq!(m.tasks_dead_lettered, 1);
        assert_eq!(m.task_failures, 5);
        assert_eq!(orch.ledger().dead_letters().await.unwrap().len(), 1);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let orch = started(vec![("denied", dyn_handler(Arc::new(Denied)))], WAIT).await;
        let id = orch.submit(TaskRequest::new("denied", tenant("t1"))).await.unwrap();

        assert_eq!(orch.wait_for_terminal(&id, WAIT).await, Some(TaskStatus::DeadLettered));
        let history = orch.ledger().history(&id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].error_summary.as_deref().unwrap().starts_with("fatal: "));
        let m = orch.metrics().snapshot();
        assert_eq!((m.tasks_dead_lettered, m.tasks_exhausted), (1, 0));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn timeouts_retry_only_idempotent_tasks() {
        let orch = started(
            vec![
                ("slow", dyn_handler(Arc::new(Sleepy { idempotent: true }))),
                ("slow-once", dyn_handler(Arc::new(Sleepy { idempotent: false }))),
            ],
            Duration::from_millis(20),
        )
        .await;

        let retried = orch
            .submit(TaskRequest::new("slow", tenant("t1")).with_max_attempts(2))
            .await
            .unwrap();
        let single = orch
            .submit(TaskRequest::new("slow-once", tenant("t1")).with_max_attempts(2))
            .await
            .unwrap();

        assert_eq!(orch.wait_for_terminal(&retried, WAIT).await, Some(TaskStatus::DeadLettered));
        assert_eq!(orch.wait_for_terminal(&single, WAIT).await, Some(TaskStatus::DeadLettered));
        assert_eq!(orch.ledger().history(&retried).await.unwrap().len(), 2);
        assert_eq!(orch.ledger().history(&single).await.unwrap().len(), 1);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn queued_task_can_be_revoked() {
        let flaky = Flaky::new(0);
        let registry = TaskRegistry::new();
        registry.register("ok", flaky.clone()).unwrap();
        let orch = Orchestrator::new(settings(WAIT), registry, TenantLocks::new(), Metrics::new());

        let id = orch.submit(TaskRequest::new("ok", tenant("t1"))).await.unwrap();
        assert_eq!(orch.cancel(&id).await, Some(CancelOutcome::Cancelled));
        orch.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(orch.status(&id).await, Some(TaskStatus::Cancelled));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
        assert_eq!(orch.cancel(&id).await, Some(CancelOutcome::AlreadyFinished));
        assert_eq!(orch.cancel(&TaskId::new()).await, None);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn running_task_cancels_cooperatively() {
        let orch = started(vec![("coop", dyn_handler(Arc::new(Cooperative)))], WAIT).await;
        let id = orch.submit(TaskRequest::new("coop", tenant("t1"))).await.unwrap();

        while orch.status(&id).await != Some(TaskStatus::Running) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(orch.cancel(&id).await, Some(CancelOutcome::Signalled));
        assert_eq!(orch.wait_for_terminal(&id, WAIT).await, Some(TaskStatus::Cancelled));
        assert_eq!(orch.metrics().snapshot().tasks_cancelled, 1);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn unique_submission_refuses_pending_duplicate() {
        let orch = started(vec![("coop", dyn_handler(Arc::new(Cooperative)))], WAIT).await;
        let first = orch
            .submit_unique(TaskRequest::new("coop", tenant("t1")))
            .await
            .unwrap();
        match orch.submit_unique(TaskRequest::new("coop", tenant("t1"))).await {
            Err(SubmitError::AlreadyPending(id)) => assert_eq!(id, first),
            other => panic!("expected AlreadyPending, got {other:?}"),
        }
        // Another tenant is unaffected.
        assert!(orch
            .submit_unique(TaskRequest::new("coop", tenant("t2")))
            .await
            .is_ok());
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_task_type_is_rejected() {
        let orch = started(vec![], WAIT).await;
        assert!(matches!(
            orch.submit(TaskRequest::new("missing", tenant("t1"))).await,
            Err(SubmitError::UnknownTaskType(_))
        ));
        orch.shutdown().await;
        assert!(matches!(
            orch.submit(TaskRequest::new("missing", tenant("t1"))).await,
            Err(SubmitError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn key_mutating_tasks_are_serialised_per_tenant() {
        let handler = Arc::new(Exclusive::default());
        let orch = started(vec![("mutate", dyn_handler(handler.clone()))], WAIT).await;

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(orch.submit(TaskRequest::new("mutate", tenant("t1"))).await.unwrap());
        }
        for id in &ids {
            assert_eq!(orch.wait_for_terminal(id, WAIT).await, Some(TaskStatus::Succeeded));
        }
        assert_eq!(handler.peak.load(Ordering::SeqCst), 1);
        assert_eq!(handler.saw_guard.load(Ordering::SeqCst), 5);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_handler_dead_letters_and_keeps_the_worker() {
        let exploding = Arc::new(Exploding::default());
        let exclusive = Arc::new(Exclusive::default());
        let registry = TaskRegistry::new();
        registry.register("explode", exploding.clone()).unwrap();
        registry.register("mutate", exclusive.clone()).unwrap();
        let orch = single_worker(registry, TenantLocks::new());
        orch.start().await;

        let id = orch.submit(TaskRequest::new("explode", tenant("t1"))).await.unwrap();
        assert_eq!(orch.wait_for_terminal(&id, WAIT).await, Some(TaskStatus::DeadLettered));
        let history = orch.ledger().history(&id).await.unwrap();
        assert_eq!(history.len(), 1);
        let summary = history[0].error_summary.as_deref().unwrap();
        assert!(summary.starts_with("fatal: handler panicked: handler bug"), "{summary}");
        assert_eq!(exploding.calls.load(Ordering::SeqCst), 1);
        let m = orch.metrics().snapshot();
        assert_eq!((m.tasks_dead_lettered, m.tasks_exhausted), (1, 0));

        // The only worker survived and the panicking attempt released t1's lock.
        let next = orch.submit(TaskRequest::new("mutate", tenant("t1"))).await.unwrap();
        assert_eq!(orch.wait_for_terminal(&next, WAIT).await, Some(TaskStatus::Succeeded));
        assert_eq!(exclusive.saw_guard.load(Ordering::SeqCst), 1);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn busy_tenant_lock_does_not_block_other_tenants() {
        let exclusive = Arc::new(Exclusive::default());
        let flaky = Flaky::new(0);
        let registry = TaskRegistry::new();
        registry.register("mutate", exclusive.clone()).unwrap();
        registry.register("ok", flaky.clone()).unwrap();
        let locks = TenantLocks::new();
        let orch = single_worker(registry, locks.clone());
        orch.start().await;

        let held = locks.lock(&tenant("t1")).await;
        let blocked = orch.submit(TaskRequest::new("mutate", tenant("t1"))).await.unwrap();
        let other = orch.submit(TaskRequest::new("ok", tenant("t2"))).await.unwrap();

        assert_eq!(orch.wait_for_terminal(&other, WAIT).await, Some(TaskStatus::Succeeded));
        assert_eq!(orch.status(&blocked).await, Some(TaskStatus::Scheduled));

        drop(held);
        assert_eq!(orch.wait_for_terminal(&blocked, WAIT).await, Some(TaskStatus::Succeeded));
        assert_eq!(exclusive.saw_guard.load(Ordering::SeqCst), 1);
        assert_eq!(orch.ledger().history(&blocked).await.unwrap().len(), 1);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn task_waiting_for_lock_can_be_revoked() {
        let exclusive = Arc::new(Exclusive::default());
        let registry = TaskRegistry::new();
        registry.register("mutate", exclusive.clone()).unwrap();
        let locks = TenantLocks::new();
        let orch = single_worker(registry, locks.clone());
        orch.start().await;

        let held = locks.lock(&tenant("t1")).await;
        let id = orch.submit(TaskRequest::new("mutate", tenant("t1"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orch.cancel(&id).await, Some(CancelOutcome::Cancelled));
        drop(held);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(orch.status(&id).await, Some(TaskStatus::Cancelled));
        assert_eq!(exclusive.saw_guard.load(Ordering::SeqCst), 0);
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_never_overwrites_a_started_attempt() {
        let gated = Arc::new(Gated {
            release: tokio::sync::Notify::new(),
        });
        let orch = started(vec![("gated", dyn_handler(gated.clone()))], WAIT).await;
        let id = orch.submit(TaskRequest::new("gated", tenant("t1"))).await.unwrap();

        while orch.status(&id).await != Some(TaskStatus::Running) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(orch.cancel(&id).await, Some(CancelOutcome::Signalled));
        assert_eq!(orch.status(&id).await, Some(TaskStatus::Running));

        gated.release.notify_one();
        assert_eq!(orch.wait_for_terminal(&id, WAIT).await, Some(TaskStatus::Succeeded));
        assert_eq!(orch.metrics().snapshot().tasks_cancelled, 0);
        orch.shutdown().await;
    }
}
