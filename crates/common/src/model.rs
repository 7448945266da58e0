//! Durable record types owned by the vault core.
//!
//! Every record serializes for storage. [`TenantKey`] and
//! [`EncryptedCredential`] carry opaque binary fields, stored as base64, and
//! print them redacted; only the DEK manager and credential store look inside
//! them, and neither is ever returned to operator tooling. [`TaskExecution`] and
//! [`Snapshot`] are safe to expose.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CorrelationId, TaskId, TenantId};

// ---------------------------------------------------------------------------
// Tenant keys
// ---------------------------------------------------------------------------

/// Lifecycle state of one DEK version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    /// The single version used for new encryption.
    Active,
    /// Superseded by rotation; still decrypts rows not yet migrated.
    Retiring,
    /// No credential references it; kept so historical ciphertext stays resolvable.
    Retired,
}

impl KeyState {
    pub fn can_encrypt(self) -> bool {
        matches!(self, KeyState::Active)
    }

    pub fn can_decrypt(self) -> bool {
        matches!(self, KeyState::Active | KeyState::Retiring)
    }
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KeyState::Active => "active",
            KeyState::Retiring => "retiring",
            KeyState::Retired => "retired",
        })
    }
}

/// One version of a tenant's wrapped Data Encryption Key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantKey {
    pub tenant_id: TenantId,
    /// Monotonic per tenant, starting at 1.
    pub version: u32,
    /// DEK ciphertext produced by the KMS provider.
    #[serde(with = "base64_bytes")]
    pub wrapped_dek: Vec<u8>,
    /// Reference to the KMS key that wrapped `wrapped_dek`.
    pub kms_key_id: String,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
    pub state: KeyState,
}

impl fmt::Debug for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantKey")
            .field("tenant_id", &self.tenant_id)
            .field("version", &self.version)
            .field("wrapped_dek", &"[REDACTED]")
            .field("kms_key_id", &self.kms_key_id)
            .field("created_at", &self.created_at)
            .field("retired_at", &self.retired_at)
            .field("state", &self.state)
            .finish()
    }
}

/// Metadata view of a [`TenantKey`] without the wrapped key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantKeyInfo {
    pub tenant_id: TenantId,
    pub version: u32,
    pub kms_key_id: String,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
    pub state: KeyState,
}

impl From<&TenantKey> for TenantKeyInfo {
    fn from(key: &TenantKey) -> Self {
        Self {
            tenant_id: key.tenant_id.clone(),
            version: key.version,
            kms_key_id: key.kms_key_id.clone(),
            created_at: key.created_at,
            retired_at: key.retired_at,
            state: key.state,
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// A tenant's stored secret for one external provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedCredential {
    pub tenant_id: TenantId,
    pub provider: String,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: [u8; 12],
    #[serde(with = "base64_bytes")]
    pub tag: [u8; 16],
    /// The [`TenantKey::version`] that encrypted this row.
    pub dek_version: u32,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for EncryptedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedCredential")
            .field("tenant_id", &self.tenant_id)
            .field("provider", &self.provider)
            .field("ciphertext", &"[REDACTED]")
            .field("dek_version", &self.dek_version)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

/// Serde adapter storing byte fields as standard base64 strings.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let encoded = String::deserialize(deserializer)?;
        let raw = STANDARD.decode(encoded).map_err(D::Error::custom)?;
        let len = raw.len();
        T::try_from(raw).map_err(|_| D::Error::custom(format!("unexpected length {len}")))
    }
}

// ---------------------------------------------------------------------------
// Task executions
// ---------------------------------------------------------------------------

/// Status of one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Scheduled,
    Running,
    Succeeded,
    Failed,
    DeadLettered,
    Cancelled,
}

impl TaskStatus {
    /// No further attempts follow a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::DeadLettered | TaskStatus::Cancelled
        )
    }

    /// Queued or executing.
    pub fn is_pending(self) -> bool {
        matches!(self, TaskStatus::Scheduled | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLettered => "dead-lettered",
            TaskStatus::Cancelled => "cancelled",
        })
    }
}

/// One attempt of an asynchronous unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: TaskId,
    pub task_type: String,
    pub tenant_id: TenantId,
    pub correlation_id: CorrelationId,
    /// 1-based, strictly increasing per `task_id`.
    pub attempt: u32,
    pub status: TaskStatus,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Backoff chosen after this attempt failed, jitter included.
    pub retry_delay_ms: Option<u64>,
    /// Redacted failure description.
    pub error_summary: Option<String>,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// A timestamped aggregate produced by the snapshot generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tenant_id: TenantId,
    pub generated_at: DateTime<Utc>,
    pub source: String,
    /// Location of the persisted payload (e.g. `s3://bucket/key` or `memory://...`).
    pub payload_ref: String,
}
