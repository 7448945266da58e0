//! Task errors and the single place failures are classified.

use std::fmt;
use std::time::Duration;

use common::TaskId;
use thiserror::Error;

use crate::credentials::CredentialError;
use crate::crypto::CipherError;
use crate::dek::DekError;
use crate::kms::KmsError;
use crate::snapshot::{AdapterError, SinkError};
use crate::storage::StorageError;

/// Failures raised by the orchestrator itself or by handlers for
/// orchestration-level reasons.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unknown task type {0:?}")]
    UnknownTaskType(String),

    #[error("invalid task payload: {0}")]
    InvalidPayload(String),

    /// The handler observed its cancellation token.
    #[error("task cancelled")]
    Cancelled,

    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),

    /// The handler panicked. Carries the panic message when it was a string.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Reasons a submission is refused.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("unknown task type {0:?}")]
    UnknownTaskType(String),

    /// A task of the same type is already scheduled or running for the tenant.
    #[error("task {0} is already pending for this tenant")]
    AlreadyPending(TaskId),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("task ledger unavailable")]
    Storage(#[from] StorageError),
}

/// Retry decision for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retried with backoff until attempts run out.
    Transient,
    /// Dead-lettered immediately.
    Fatal,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureClass::Transient => "transient",
            FailureClass::Fatal => "fatal",
        })
    }
}

/// Classify a failed attempt by walking its error chain.
///
/// Timeouts are transient only for idempotent task types; panics never are.
/// Storage write failures are transient. Errors no component recognises are
/// treated as transient.
pub fn classify(err: &anyhow::Error, idempotent: bool) -> FailureClass {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<TaskError>() {
            return match e {
                TaskError::TimedOut(_) if idempotent => FailureClass::Transient,
                _ => FailureClass::Fatal,
            };
        }
        if let Some(e) = cause.downcast_ref::<KmsError>() {
            return kms_class(e);
        }
        if let Some(e) = cause.downcast_ref::<DekError>() {
            return match e {
                DekError::Kms(k) => kms_class(k),
                DekError::RotationInProgress(_) | DekError::Storage(_) => FailureClass::Transient,
                _ => FailureClass::Fatal,
            };
        }
        if let Some(e) = cause.downcast_ref::<CredentialError>() {
            match e {
                // Classified by the wrapped DEK error further down the chain.
                CredentialError::Dek(_) => continue,
                CredentialError::Storage(_) => return FailureClass::Transient,
                _ => return FailureClass::Fatal,
            }
        }
        if let Some(CipherError::Integrity) = cause.downcast_ref::<CipherError>() {
            return FailureClass::Fatal;
        }
        if let Some(e) = cause.downcast_ref::<AdapterError>() {
            return match e {
                AdapterError::Unauthorized(_) => FailureClass::Fatal,
                _ => FailureClass::Transient,
            };
        }
        if cause.downcast_ref::<SinkError>().is_some()
            || cause.downcast_ref::<StorageError>().is_some()
        {
            return FailureClass::Transient;
        }
    }
    FailureClass::Transient
}

fn kms_class(err: &KmsError) -> FailureClass {
    if err.is_retryable() {
        FailureClass::Transient
    } else {
        FailureClass::Fatal
    }
}
