//! Metrics counters for tasks, rotations, and KMS calls.
//!
//! Each event increments a process-local atomic (readable through
//! [`Metrics::snapshot`]) and the matching OpenTelemetry instrument on the
//! global meter. When no meter provider is installed the OTel side is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{global, KeyValue};
use serde::{Deserialize, Serialize};

/// Point-in-time copy of the process-local counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub task_attempts: u64,
    pub task_successes: u64,
    pub task_failures: u64,
    /// Tasks dead-lettered because every attempt failed.
    pub tasks_exhausted: u64,
    /// All dead-lettered tasks, fatal failures included.
    pub tasks_dead_lettered: u64,
    pub tasks_cancelled: u64,
    pub rotation_successes: u64,
    pub rotation_failures: u64,
    pub kms_calls: u64,
    pub kms_errors: u64,
}

#[derive(Default)]
struct Counters {
    task_attempts: AtomicU64,
    task_successes: AtomicU64,
    task_failures: AtomicU64,
    tasks_exhausted: AtomicU64,
    tasks_dead_lettered: AtomicU64,
    tasks_cancelled: AtomicU64,
    rotation_successes: AtomicU64,
    rotation_failures: AtomicU64,
    kms_calls: AtomicU64,
    kms_errors: AtomicU64,
}

struct Instruments {
    task_attempts: Counter<u64>,
    task_successes: Counter<u64>,
    task_failures: Counter<u64>,
    tasks_exhausted: Counter<u64>,
    tasks_dead_lettered: Counter<u64>,
    tasks_cancelled: Counter<u64>,
    rotations: Counter<u64>,
    kms_calls: Counter<u64>,
    kms_errors: Counter<u64>,
    kms_latency_ms: Histogram<f64>,
}

impl Instruments {
    fn new() -> Self {
        let meter = global::meter("tenant-vault");
        Self {
            task_attempts: meter.u64_counter("vault.task.attempts").init(),
            task_successes: meter.u64_counter("vault.task.successes").init(),
            task_failures: meter.u64_counter("vault.task.failures").init(),
            tasks_exhausted: meter
                .u64_counter("vault.task.exhausted")
                .with_description("tasks dead-lettered after their final attempt failed")
                .init(),
            tasks_dead_lettered: meter.u64_counter("vault.task.dead_lettered").init(),
            tasks_cancelled: meter.u64_counter("vault.task.cancelled").init(),
            rotations: meter.u64_counter("vault.dek.rotations").init(),
            kms_calls: meter.u64_counter("vault.kms.calls").init(),
            kms_errors: meter.u64_counter("vault.kms.errors").init(),
            kms_latency_ms: meter
                .f64_histogram("vault.kms.latency")
                .with_unit(opentelemetry::metrics::Unit::new("ms"))
                .init(),
        }
    }
}

struct Inner {
    counters: Counters,
    otel: Instruments,
}

/// Cheaply cloneable metrics handle shared by every component.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: Counters::default(),
                otel: Instruments::new(),
            }),
        }
    }

    pub fn task_attempt(&self, task_type: &str) {
        bump(&self.inner.counters.task_attempts);
        self.inner.otel.task_attempts.add(1, &task_attrs(task_type));
    }

    pub fn task_succeeded(&self, task_type: &str) {
        bump(&self.inner.counters.task_successes);
        self.inner.otel.task_successes.add(1, &task_attrs(task_type));
    }

    pub fn task_failed(&self, task_type: &str) {
        bump(&self.inner.counters.task_failures);
        self.inner.otel.task_failures.add(1, &task_attrs(task_type));
    }

    /// Record a dead letter. `exhausted` is true when the retry budget ran out
    /// (as opposed to a fatal, non-retryable failure).
    pub fn task_dead_lettered(&self, task_type: &str, exhausted: bool) {
        bump(&self.inner.counters.tasks_dead_lettered);
        self.inner
            .otel
            .tasks_dead_lettered
            .add(1, &task_attrs(task_type));
        if exhausted {
            bump(&self.inner.counters.tasks_exhausted);
            self.inner.otel.tasks_exhausted.add(1, &task_attrs(task_type));
        }
    }

    pub fn task_cancelled(&self, task_type: &str) {
        bump(&self.inner.counters.tasks_cancelled);
        self.inner.otel.tasks_cancelled.add(1, &task_attrs(task_type));
    }

    pub fn rotation(&self, succeeded: bool) {
        let (counter, outcome) = if succeeded {
            (&self.inner.counters.rotation_successes, "success")
        } else {
            (&self.inner.counters.rotation_failures, "failure")
        };
        bump(counter);
        self.inner
            .otel
            .rotations
            .add(1, &[KeyValue::new("outcome", outcome)]);
    }

    pub fn kms_call(&self, operation: &'static str, latency: Duration, ok: bool) {
        let attrs = [
            KeyValue::new("component", "kms"),
            KeyValue::new("operation", operation),
        ];
        bump(&self.inner.counters.kms_calls);
        self.inner.otel.kms_calls.add(1, &attrs);
        self.inner
            .otel
            .kms_latency_ms
            .record(latency.as_secs_f64() * 1000.0, &attrs);
        if !ok {
            bump(&self.inner.counters.kms_errors);
            self.inner.otel.kms_errors.add(1, &attrs);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.inner.counters;
        MetricsSnapshot {
            task_attempts: read(&c.task_attempts),
            task_successes: read(&c.task_successes),
            task_failures: read(&c.task_failures),
            tasks_exhausted: read(&c.tasks_exhausted),
            tasks_dead_lettered: read(&c.tasks_dead_lettered),
            tasks_cancelled: read(&c.tasks_cancelled),
            rotation_successes: read(&c.rotation_successes),
            rotation_failures: read(&c.rotation_failures),
            kms_calls: read(&c.kms_calls),
            kms_errors: read(&c.kms_errors),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn task_attrs(task_type: &str) -> [KeyValue; 2] {
    [
        KeyValue::new("component", "orchestrator"),
        KeyValue::new("task_type", task_type.to_owned()),
    ]
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
