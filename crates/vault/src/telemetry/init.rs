//! Tracing subscriber initialisation with optional OTLP export.

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use super::format::JsonEventFormat;

/// Initialise the global tracing subscriber and, when `otlp_endpoint` is set,
/// the OTEL trace and metrics pipelines.
///
/// Configures:
/// - A [`JsonEventFormat`] layer for structured log output on stdout.
/// - A [`tracing_opentelemetry`] layer that exports spans to the OTLP endpoint.
/// - An OTLP metrics pipeline installed as the global meter provider.
///
/// # Errors
///
/// Returns an error if the OTLP exporter or SDK pipeline cannot be initialised,
/// or if a global subscriber is already set.
pub fn init_telemetry(otlp_endpoint: Option<&str>, log_level: &str) -> Result<()> {
    let otel_layer = match otlp_endpoint {
        Some(endpoint) => {
            // --- Tracing pipeline ---
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(
                    opentelemetry_sdk::trace::Config::default().with_resource(service_resource()),
                )
                .install_batch(runtime::Tokio)
                .context("failed to install OTLP tracing pipeline")?;

            // --- Metrics pipeline ---
            let meter_provider = opentelemetry_otlp::new_pipeline()
                .metrics(runtime::Tokio)
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_resource(service_resource())
                .build()
                .context("failed to install OTLP metrics pipeline")?;
            opentelemetry::global::set_meter_provider(meter_provider);

            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    // --- Subscriber ---
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().event_format(JsonEventFormat))
        .with(otel_layer)
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    Ok(())
}

fn service_resource() -> Resource {
    Resource::new(vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            "tenant-vault",
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ])
}
