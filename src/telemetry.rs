//! Process entry-point telemetry: an `EnvFilter`-based `tracing-subscriber`
//! for binaries/tests. Library code never initializes a global subscriber
//! itself — only `main`/test harnesses call [`init_telemetry`].
//!
//! Span export to an OTLP collector is behind the `observability` feature;
//! without it, `init_telemetry` wires console logging only.

#[cfg(feature = "observability")]
use std::time::Duration;

#[cfg(feature = "observability")]
use opentelemetry::KeyValue;
#[cfg(feature = "observability")]
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Configuration for process-wide tracing, read from the environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otlp_endpoint: Option<String>,
    pub log_filter: Option<String>,
    pub enable_console: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "workflow-core".to_string(),
            otlp_endpoint: None,
            log_filter: None,
            enable_console: true,
        }
    }
}

impl TelemetryConfig {
    /// Reads `OTEL_SERVICE_NAME`, `OTEL_EXPORTER_OTLP_ENDPOINT` and
    /// `RUST_LOG`.
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "workflow-core".to_string()),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            log_filter: std::env::var("RUST_LOG").ok(),
            enable_console: true,
        }
    }
}

/// Holds the tracer provider alive for the process lifetime; dropping it
/// flushes and shuts down span export.
pub struct TelemetryGuard {
    #[cfg(feature = "observability")]
    provider: Option<SdkTracerProvider>,
}

#[cfg(feature = "observability")]
impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(err) = provider.shutdown() {
                eprintln!("failed to shut down tracer provider: {err:?}");
            }
        }
    }
}

/// Initializes the global `tracing` subscriber. Keep the returned guard
/// alive for the life of the process.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = config
        .log_filter
        .as_deref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let console_layer =
        if config.enable_console { Some(tracing_subscriber::fmt::layer().with_target(true).with_filter(filter)) } else { None };

    #[cfg(feature = "observability")]
    {
        let (provider, otel_layer) = match &config.otlp_endpoint {
            Some(endpoint) => match build_otlp_tracer(endpoint, &config.service_name) {
                Ok((provider, tracer)) => {
                    let layer = tracing_opentelemetry::layer().with_tracer(tracer);
                    (Some(provider), Some(layer))
                }
                Err(err) => {
                    eprintln!("failed to initialize OTLP exporter, continuing without span export: {err}");
                    (None, None)
                }
            },
            None => (None, None),
        };

        tracing_subscriber::registry().with(console_layer).with(otel_layer).init();

        if provider.is_some() {
            tracing::info!(endpoint = ?config.otlp_endpoint, "OpenTelemetry span export enabled");
        }
        return TelemetryGuard { provider };
    }

    #[cfg(not(feature = "observability"))]
    {
        tracing_subscriber::registry().with(console_layer).init();
        TelemetryGuard {}
    }
}

#[cfg(feature = "observability")]
fn build_otlp_tracer(
    endpoint: &str,
    service_name: &str,
) -> Result<(SdkTracerProvider, opentelemetry_sdk::trace::Tracer), opentelemetry::trace::TraceError> {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::{SpanExporter, WithExportConfig};

    let exporter = SpanExporter::builder().with_tonic().with_endpoint(endpoint).with_timeout(Duration::from_secs(10)).build()?;

    let resource = Resource::builder().with_attributes(vec![KeyValue::new("service.name", service_name.to_string())]).build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = provider.tracer(service_name.to_string());
    Ok((provider, tracer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_default_has_console_enabled() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "workflow-core");
        assert!(config.otlp_endpoint.is_none());
        assert!(config.enable_console);
    }
}
