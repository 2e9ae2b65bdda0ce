//! Tracing setup
//!
//! Logs go to stdout through `tracing-subscriber`; spans are additionally
//! exported over OTLP when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::{runtime, trace, Resource};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

const SERVICE_NAME: &str = "anck-operator";

fn otlp_tracer(endpoint: &str) -> Result<trace::Tracer> {
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let mut attributes = vec![KeyValue::new("service.name", SERVICE_NAME)];
    if let Ok(namespace) = std::env::var("POD_NAMESPACE") {
        attributes.push(KeyValue::new("k8s.namespace.name", namespace));
    }
    if let Ok(pod) = std::env::var("POD_NAME") {
        attributes.push(KeyValue::new("k8s.pod.name", pod));
    }

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(trace::config().with_resource(Resource::new(attributes)))
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::ConfigError(format!("OTLP exporter: {e}")))
}

/// Install the global subscriber
///
/// `json` switches stdout logging to one JSON object per line.
pub fn init_tracing(json: bool) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    let otel_layer = match endpoint.as_deref() {
        Some(endpoint) => Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(endpoint)?)),
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| fmt::layer().json().with_target(true)))
        .with((!json).then(|| fmt::layer().with_target(true)))
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::ConfigError(format!("tracing subscriber: {e}")))?;

    match endpoint {
        Some(endpoint) => info!(%endpoint, "OpenTelemetry tracing initialized"),
        None => info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)"),
    }
    Ok(())
}

/// Flush pending spans
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}
