//! Boundary to external data sources (ad platforms, analytics APIs).

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::crypto::SecretBytes;

/// Errors reported by a source adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Network or upstream failure. Retryable.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The upstream rejected the credentials. Retrying cannot help.
    #[error("source rejected credentials: {0}")]
    Unauthorized(String),

    /// The upstream answered with something the adapter cannot parse.
    #[error("invalid source response: {0}")]
    InvalidResponse(String),
}

/// Inclusive time window a snapshot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// The `days` days ending at `end`, or `None` if the start would fall
    /// outside the representable calendar.
    pub fn last_days(end: DateTime<Utc>, days: u32) -> Option<Self> {
        let span = Duration::try_days(i64::from(days))?;
        Some(Self {
            start: end.checked_sub_signed(span)?,
            end,
        })
    }
}

/// Decrypted credentials handed to an adapter for one fetch.
pub struct Credentials {
    pub provider: String,
    secret: SecretBytes,
}

impl Credentials {
    pub fn new(provider: impl Into<String>, secret: SecretBytes) -> Self {
        Self {
            provider: provider.into(),
            secret,
        }
    }

    pub fn expose(&self) -> &[u8] {
        self.secret.expose()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("provider", &self.provider)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Fetches raw records for one source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Source name; matches the provider name credentials are stored under.
    fn source(&self) -> String;

    async fn fetch(
        &self,
        credentials: &Credentials,
        range: DateRange,
    ) -> Result<Vec<serde_json::Value>, AdapterError>;
}
