//! Configuration loading and validation for the vault service.
//!
//! All values are read from environment variables at startup. The process will
//! exit with a clear error message if any required variable is missing or invalid.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Validated vault service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// KMS backend: `"local"` or `"aws"`.
    #[serde(default = "default_kms_backend")]
    pub kms_backend: String,

    /// Reference of the wrapping key recorded on every tenant key. **Required.**
    pub kms_key_id: String,

    /// Base64 32-byte master key for the local backend.
    #[serde(default)]
    pub local_master_key: Option<String>,

    /// Endpoint override for AWS KMS (VPC endpoint or emulator).
    #[serde(default)]
    pub kms_endpoint_url: Option<String>,

    /// Number of task workers.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Capacity of the bounded work queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Attempts allowed per task unless the submitter overrides it.
    #[serde(default = "default_task_max_attempts")]
    pub task_max_attempts: u32,

    /// Time unit of the exponential backoff.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Hard wall-clock limit per task attempt.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Maximum age of an active tenant key before it is rotated.
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: u64,

    /// How often the rotation scheduler looks for due tenants.
    #[serde(default = "default_rotation_check_interval")]
    pub rotation_check_interval_secs: u64,

    /// S3 bucket for snapshot payloads. Snapshots are kept in memory if unset.
    #[serde(default)]
    pub snapshot_bucket: Option<String>,

    /// S3 key prefix for snapshot payloads.
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,

    /// Default number of days fetched by a snapshot.
    #[serde(default = "default_snapshot_window_days")]
    pub snapshot_window_days: u32,

    /// Directory holding the JSON state files. Keys, credentials and task
    /// history live only in memory when unset.
    #[serde(default)]
    pub state_dir: Option<String>,

    /// Port of the operator HTTP endpoint.
    #[serde(default = "default_ops_port")]
    pub ops_port: u16,

    /// OTLP collector endpoint. Export is disabled when unset.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_kms_backend() -> String {
    "local".into()
}
fn default_worker_count() -> usize {
    8
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_task_max_attempts() -> u32 {
    5
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_task_timeout_secs() -> u64 {
    300
}
fn default_rotation_interval() -> u64 {
    90 * 24 * 3600
}
fn default_rotation_check_interval() -> u64 {
    3600
}
fn default_snapshot_prefix() -> String {
    "snapshots/".into()
}
fn default_snapshot_window_days() -> u32 {
    30
}
fn default_ops_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default().try_parsing(true))
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.kms_key_id, "KMS_KEY_ID")?;

        match self.kms_backend.as_str() {
            "local" => {
                let key = self.local_master_key.as_deref().unwrap_or_default();
                ensure_non_empty(key, "LOCAL_MASTER_KEY")?;
            }
            "aws" => {}
            other => anyhow::bail!("KMS_BACKEND must be \"local\" or \"aws\", got {other:?}"),
        }

        if self.worker_count == 0 {
            anyhow::bail!("WORKER_COUNT must be > 0");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("QUEUE_CAPACITY must be > 0");
        }
        if self.task_max_attempts == 0 {
            anyhow::bail!("TASK_MAX_ATTEMPTS must be > 0");
        }
        if self.task_timeout_secs == 0 {
            anyhow::bail!("TASK_TIMEOUT_SECS must be > 0");
        }
        if self.rotation_interval_secs == 0 {
            anyhow::bail!("ROTATION_INTERVAL_SECS must be > 0");
        }
        if self.rotation_check_interval_secs == 0 {
            anyhow::bail!("ROTATION_CHECK_INTERVAL_SECS must be > 0");
        }
        if let Some(bucket) = &self.snapshot_bucket {
            ensure_non_empty(bucket, "SNAPSHOT_BUCKET")?;
        }
        if let Some(dir) = &self.state_dir {
            ensure_non_empty(dir, "STATE_DIR")?;
        }
        Ok(())
    }

    pub fn retry_unit(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn rotation_check_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_check_interval_secs)
    }

    pub fn state_dir(&self) -> Option<PathBuf> {
        self.state_dir.as_deref().map(PathBuf::from)
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
