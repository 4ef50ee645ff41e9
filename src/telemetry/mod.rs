//! Tracing and OpenTelemetry initialization.
//!
//! Queue, lock and worker events are plain `tracing` events. The fmt layer
//! always writes them to stderr; when an OTLP endpoint is configured, spans,
//! metrics and log records are exported there as well.

pub mod metrics;
pub mod queue;

use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Instrumentation scope for spans emitted by this crate.
const TRACER_NAME: &str = "workq";

/// Dependencies that are chatty at `info` and `debug`.
const QUIET_TARGETS: &[&str] = &["sqlx", "h2", "hyper", "tonic", "tower"];

/// Configuration for telemetry initialization.
pub struct TelemetryConfig {
    /// Optional OTLP endpoint (e.g. "http://localhost:4317").
    pub endpoint: Option<String>,
    /// The service name reported in telemetry signals.
    pub service_name: String,
    /// Used when `RUST_LOG` is unset. A bare level ("debug") applies to
    /// `workq` only; anything with a target is taken as a full directive.
    pub log_level: String,
}

impl TelemetryConfig {
    pub fn from_config(config: &crate::config::Config, service_name: impl Into<String>) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: service_name.into(),
            log_level: config.log_level.clone(),
        }
    }
}

/// The three OTLP pipelines, built together or not at all.
struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

/// Flushes and shuts down the OTLP pipelines on drop. Hold it for the
/// lifetime of the process.
pub struct TelemetryGuard {
    providers: Option<Providers>,
}

impl TelemetryGuard {
    /// Whether spans and metrics leave the process.
    pub fn is_exporting(&self) -> bool {
        self.providers.is_some()
    }

    /// Push buffered signals out now. Short-lived commands call this before exit.
    pub fn force_flush(&self) {
        if let Some(providers) = &self.providers {
            let _ = providers.tracer.force_flush();
            let _ = providers.meter.force_flush();
            let _ = providers.logger.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Logs first, traces last.
        if let Some(providers) = self.providers.take() {
            let _ = providers.logger.shutdown();
            let _ = providers.meter.shutdown();
            let _ = providers.tracer.shutdown();
        }
    }
}

/// Filter directive used when `RUST_LOG` is unset.
pub(crate) fn fallback_directive(log_level: &str) -> String {
    let log_level = log_level.trim();
    if log_level.contains('=') || log_level.contains(',') {
        return log_level.to_string();
    }
    let mut directive = format!("info,{TRACER_NAME}={log_level}");
    for target in QUIET_TARGETS {
        directive.push_str(&format!(",{target}=warn"));
    }
    directive
}

fn env_filter(log_level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = fallback_directive(log_level);
    EnvFilter::try_new(&directive)
        .map_err(|e| Error::Telemetry(format!("invalid log filter {directive:?}: {e}")))
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Telemetry(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn build_providers(endpoint: &str, service_name: String) -> Result<Providers> {
    use opentelemetry_otlp::WithExportConfig as _;

    let resource = opentelemetry_sdk::Resource::builder()
        .with_service_name(service_name)
        .with_attribute(opentelemetry::KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build();

    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("span", e))?;
    let tracer = SdkTracerProvider::builder()
        .with_batch_exporter(spans)
        .with_resource(resource.clone())
        .build();

    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metric", e))?;
    let meter = SdkMeterProvider::builder()
        .with_periodic_exporter(metrics)
        .with_resource(resource.clone())
        .build();

    let logs = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("log", e))?;
    let logger = SdkLoggerProvider::builder()
        .with_batch_exporter(logs)
        .with_resource(resource)
        .build();

    Ok(Providers {
        tracer,
        meter,
        logger,
    })
}

/// Install the global subscriber and, with an endpoint, the OTLP pipelines.
///
/// # Errors
///
/// Fails on a malformed log filter, an exporter that cannot be built, or a
/// global subscriber that is already set.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = env_filter(&config.log_level)?;
    let providers = config
        .endpoint
        .as_deref()
        .map(|endpoint| build_providers(endpoint, config.service_name.clone()))
        .transpose()?;

    let (trace_layer, log_layer) = match &providers {
        Some(providers) => {
            opentelemetry::global::set_meter_provider(providers.meter.clone());
            let tracer = providers.tracer.tracer(TRACER_NAME);
            (
                Some(tracing_opentelemetry::layer().with_tracer(tracer)),
                Some(
                    opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(
                        &providers.logger,
                    ),
                ),
            )
        }
        None => (None, None),
    };

    // Compact lines when exporting; the full record goes to the collector.
    let compact = providers.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(compact.then(|| tracing_subscriber::fmt::layer().compact()))
        .with((!compact).then(|| tracing_subscriber::fmt::layer()))
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Telemetry(format!("failed to init tracing subscriber: {e}")))?;

    Ok(TelemetryGuard { providers })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_level_applies_to_this_crate_and_quiets_dependencies() {
        let directive = fallback_directive("debug");
        assert!(directive.starts_with("info,workq=debug"));
        assert!(directive.contains("sqlx=warn"));
        assert!(EnvFilter::try_new(&directive).is_ok());
    }

    #[test]
    fn full_directives_pass_through() {
        assert_eq!(fallback_directive("warn,workq=trace"), "warn,workq=trace");
        assert_eq!(fallback_directive(" sqlx=debug "), "sqlx=debug");
    }
}
