//! `vault` binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`] from environment variables.
//! 2. Initialise the telemetry pipeline (JSON logs, optional OTLP).
//! 3. Hand over to [`vault::service::run`].
//!
//! The binary ships without snapshot source adapters, so it only runs key
//! rotation. Deployments that generate snapshots embed the library and pass
//! their adapters to `service::run`.

use anyhow::Result;
use tracing::info;

use vault::config::Config;
use vault::service;
use vault::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: configuration invalid: {e:#}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init_telemetry(cfg.otel_exporter_otlp_endpoint.as_deref(), &cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        kms_backend = %cfg.kms_backend,
        workers = cfg.worker_count as u64,
        ops_port = cfg.ops_port,
        persistent = cfg.state_dir.is_some(),
        "vault starting"
    );

    // -----------------------------------------------------------------------
    // 3. Service
    // -----------------------------------------------------------------------
    service::run(cfg, Vec::new()).await
}
