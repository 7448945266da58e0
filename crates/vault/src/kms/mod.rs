//! Key Management Service abstraction: wraps and unwraps tenant DEKs.
//!
//! Backends:
//! - [`LocalKms`]: HMAC-derived per-tenant wrapping keys from a configured
//!   master key. For development and tests.
//! - [`AwsKms`]: AWS KMS `Encrypt`/`Decrypt` with a `tenant_id` encryption
//!   context.
//!
//! Every backend is wrapped in [`InstrumentedKms`], which records call counts,
//! error counts, and latency.
//!
//! # Security invariants
//!
//! - Neither plaintext DEKs nor wrapped ciphertext are ever logged.
//! - A key wrapped for one tenant cannot be unwrapped for another.

pub mod aws;
pub mod local;

pub use aws::AwsKms;
pub use local::LocalKms;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::TenantContext;
use thiserror::Error;
use tracing::{debug, warn};

use crate::aws::AwsClients;
use crate::config::Config;
use crate::crypto::DekBytes;
use crate::telemetry::Metrics;

const COMPONENT: &str = "kms";

/// Errors produced by a KMS backend.
#[derive(Debug, Error)]
pub enum KmsError {
    /// Network or service error. Retryable.
    #[error("kms unavailable: {0}")]
    Unavailable(String),

    /// The caller may not use the key. Fatal; needs operator intervention.
    #[error("kms access denied: {0}")]
    AccessDenied(String),

    /// The referenced wrapping key does not exist. Fatal.
    #[error("kms key not found: {0}")]
    KeyNotFound(String),

    /// The KMS returned key material of the wrong shape.
    #[error("invalid kms response: {0}")]
    InvalidResponse(&'static str),
}

impl KmsError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, KmsError::Unavailable(_))
    }
}

/// DEK ciphertext plus the reference of the key that wrapped it.
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub kms_key_id: String,
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedKey")
            .field("kms_key_id", &self.kms_key_id)
            .field("ciphertext", &"[REDACTED]")
            .finish()
    }
}

/// Pluggable key-wrapping backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KmsProvider: Send + Sync {
    /// Reference of the wrapping key new DEKs are wrapped under.
    fn key_id(&self) -> String;

    /// Wrap `plaintext_key` for `ctx.tenant_id`.
    async fn wrap(&self, plaintext_key: &DekBytes, ctx: &TenantContext)
        -> Result<WrappedKey, KmsError>;

    /// Unwrap a key previously wrapped for `ctx.tenant_id`.
    async fn unwrap(&self, wrapped: &WrappedKey, ctx: &TenantContext)
        -> Result<DekBytes, KmsError>;
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Which KMS backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmsBackend {
    Local,
    Aws,
}

/// Explicitly injected KMS configuration.
#[derive(Debug, Clone)]
pub struct KmsSettings {
    pub backend: KmsBackend,
    pub key_id: String,
    /// Required for [`KmsBackend::Local`].
    pub local_master_key: Option<DekBytes>,
    /// Optional endpoint override for [`KmsBackend::Aws`], applied when the
    /// AWS clients are initialised.
    pub endpoint_url: Option<String>,
}

impl KmsSettings {
    /// Derive KMS settings from the validated service configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the local master key is not valid base64 of
    /// exactly 32 bytes.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let backend = match cfg.kms_backend.as_str() {
            "aws" => KmsBackend::Aws,
            _ => KmsBackend::Local,
        };
        let local_master_key = match cfg.local_master_key.as_deref() {
            Some(encoded) => {
                let raw = STANDARD
                    .decode(encoded.trim())
                    .context("LOCAL_MASTER_KEY is not valid base64")?;
                let key = DekBytes::from_slice(&raw)
                    .context("LOCAL_MASTER_KEY must decode to exactly 32 bytes")?;
                Some(key)
            }
            None => None,
        };
        Ok(Self {
            backend,
            key_id: cfg.kms_key_id.clone(),
            local_master_key,
            endpoint_url: cfg.kms_endpoint_url.clone(),
        })
    }
}

/// Construct the configured backend, wrapped in [`InstrumentedKms`].
///
/// # Errors
///
/// Returns an error if the local backend is selected without a master key, or
/// the AWS backend without initialised AWS clients.
pub fn build_provider(
    settings: &KmsSettings,
    aws: Option<&AwsClients>,
    metrics: Metrics,
) -> Result<Arc<dyn KmsProvider>> {
    let inner: Arc<dyn KmsProvider> = match settings.backend {
        KmsBackend::Local => {
            let master = settings
                .local_master_key
                .clone()
                .context("local KMS backend requires LOCAL_MASTER_KEY")?;
            Arc::new(LocalKms::new(settings.key_id.clone(), master))
        }
        KmsBackend::Aws => {
            let clients = aws.context("AWS KMS backend requires AWS clients")?;
            Arc::new(AwsKms::new(clients.kms.clone(), settings.key_id.clone()))
        }
    };
    Ok(Arc::new(InstrumentedKms::new(inner, metrics)))
}

// ---------------------------------------------------------------------------
// Instrumentation
// ---------------------------------------------------------------------------

/// Decorator recording `kms_calls`, `kms_errors` and `kms_latency_ms`.
pub struct InstrumentedKms {
    inner: Arc<dyn KmsProvider>,
    metrics: Metrics,
}

impl InstrumentedKms {
    pub fn new(inner: Arc<dyn KmsProvider>, metrics: Metrics) -> Self {
        Self { inner, metrics }
    }

    fn observe<T>(
        &self,
        operation: &'static str,
        started: Instant,
        ctx: &TenantContext,
        result: &Result<T, KmsError>,
    ) {
        let latency = started.elapsed();
        self.metrics.kms_call(operation, latency, result.is_ok());
        match result {
            Ok(_) => debug!(
                tenant_id = %ctx.tenant_id,
                correlation_id = %ctx.correlation_id,
                component = COMPONENT,
                operation,
                latency_ms = latency.as_millis() as u64,
                "kms call succeeded"
            ),
            Err(e) => warn!(
                tenant_id = %ctx.tenant_id,
                correlation_id = %ctx.correlation_id,
                component = COMPONENT,
                operation,
                retryable = e.is_retryable(),
                error = %e,
                "kms call failed"
            ),
        }
    }
}

#[async_trait]
impl KmsProvider for InstrumentedKms {
    fn key_id(&self) -> String {
        self.inner.key_id()
    }

    async fn wrap(
        &self,
        plaintext_key: &DekBytes,
        ctx: &TenantContext,
    ) -> Result<WrappedKey, KmsError> {
        let started = Instant::now();
        let result = self.inner.wrap(plaintext_key, ctx).await;
        self.observe("wrap", started, ctx, &result);
        result
    }

    async fn unwrap(
        &self,
        wrapped: &WrappedKey,
        ctx: &TenantContext,
    ) -> Result<DekBytes, KmsError> {
        let started = Instant::now();
        let result = self.inner.unwrap(wrapped, ctx).await;
        self.observe("unwrap", started, ctx, &result);
        result
    }
}
