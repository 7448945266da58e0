//! Observability: structured JSON logs, metrics counters, and optional OTLP export.
//!
//! # Telemetry invariants
//!
//! - **No plaintext secret, token, or key material** may appear in any log
//!   field, span attribute, or metric label.
//! - Every tenant-scoped log call passes `tenant_id`, `correlation_id` and
//!   `component` explicitly; there is no ambient context.
//! - Log level is configurable via `LOG_LEVEL` (default: `info`), overridden by
//!   `RUST_LOG` when set.

pub mod format;
pub mod init;
pub mod metrics;
pub mod redact;

pub use format::JsonEventFormat;
pub use init::init_telemetry;
pub use metrics::{Metrics, MetricsSnapshot};
