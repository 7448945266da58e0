//! Identifier newtypes threaded through every component call and log line.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Maximum accepted length of a tenant identifier.
pub const MAX_TENANT_ID_LEN: usize = 128;

/// Returned when a tenant identifier is empty, too long, or contains
/// characters outside `[A-Za-z0-9._-]`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid tenant id")]
pub struct InvalidTenantId;

/// An isolated customer account. All key and credential material is
/// partitioned by this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Validate and wrap a tenant identifier.
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidTenantId> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.len() <= MAX_TENANT_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
        if valid {
            Ok(Self(raw))
        } else {
            Err(InvalidTenantId)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = InvalidTenantId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Identifier attached to every log line and metric event belonging to one
/// logical operation, including nested tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one submitted unit of work (shared by all its attempts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a task id from its hyphenated string form.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The explicit tenant/correlation pair passed to every tenant-scoped call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: TenantId,
    pub correlation_id: CorrelationId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId, correlation_id: CorrelationId) -> Self {
        Self {
            tenant_id,
            correlation_id,
        }
    }

    /// A context with a freshly generated correlation id.
    pub fn fresh(tenant_id: TenantId) -> Self {
        Self::new(tenant_id, CorrelationId::new())
    }
}
