//! OpenTelemetry tracing export
//!
//! Enabled when `OTEL_EXPORTER_OTLP_ENDPOINT` is set. Spans recorded through
//! `tracing` are batched and shipped over OTLP/gRPC.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::Tracer;
use opentelemetry_sdk::{runtime, Resource};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;

/// Environment variable naming the collector endpoint
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

const SERVICE_NAME: &str = "health-sync-operator";

/// Collector endpoint from the environment, if configured
pub fn otlp_endpoint() -> Option<String> {
    std::env::var(OTLP_ENDPOINT_ENV)
        .ok()
        .filter(|endpoint| !endpoint.is_empty())
}

fn resource() -> Resource {
    let mut attributes = vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ];
    // Set through the downward API in the operator Deployment
    if let Ok(pod_name) = std::env::var("POD_NAME") {
        attributes.push(KeyValue::new("k8s.pod.name", pod_name));
    }
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace));
    }
    Resource::new(attributes)
}

/// Build the OTLP tracing layer for `_subscriber`.
///
/// Returns `None` when no endpoint is configured or the exporter cannot be
/// installed; logging keeps working either way.
pub fn init_telemetry<S>(_subscriber: &S) -> Option<OpenTelemetryLayer<S, Tracer>>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let endpoint = otlp_endpoint()?;

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(resource()))
        .install_batch(runtime::Tokio);

    match tracer {
        Ok(tracer) => Some(tracing_opentelemetry::layer().with_tracer(tracer)),
        Err(e) => {
            // The subscriber is not installed yet
            eprintln!("failed to initialize OTLP exporter: {e}");
            None
        }
    }
}

/// Flush buffered spans; call once before the process exits
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
