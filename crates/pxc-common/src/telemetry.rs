//! Logging, tracing and metrics setup shared by the operator and the PITR binary
//!
//! Logs always go to stdout through `tracing-subscriber`, as JSON unless
//! `LOG_FORMAT=text`. When `OTEL_EXPORTER_OTLP_ENDPOINT` is set, spans and
//! metrics are exported over OTLP gRPC as well. A binary that serves its own
//! `/metrics` hands in a Prometheus registry, which then receives every
//! instrument too.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset
const DEFAULT_FILTER: &str = "info,kube=info,tower=warn,hyper=warn,sqlx=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// An OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {message}")]
    Exporter {
        /// "span" or "metric"
        signal: &'static str,
        /// Exporter error
        message: String,
    },

    /// A global subscriber was already installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Shape of the log lines written to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable lines
    Text,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("text") => Self::Text,
            _ => Self::Json,
        }
    }
}

/// Telemetry settings
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name reported on spans and metrics
    pub service_name: String,
    /// OTLP gRPC endpoint; logs only when `None`
    pub otlp_endpoint: Option<String>,
    /// Log line format
    pub log_format: LogFormat,
    /// Registry that metrics are also exposed through
    pub prometheus: Option<prometheus::Registry>,
}

impl TelemetryConfig {
    /// Settings for `service_name` taken from the process environment
    pub fn for_service(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|e| !e.is_empty()),
            log_format: LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref()),
            prometheus: None,
        }
    }

    /// Also expose metrics through `registry`
    pub fn with_prometheus(mut self, registry: prometheus::Registry) -> Self {
        self.prometheus = Some(registry);
        self
    }
}

/// Keeps the providers alive; flushes them when dropped
#[must_use = "dropping the guard shuts the exporters down"]
pub struct TelemetryGuard {
    tracer: Option<TracerProvider>,
    meter: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(tracer) = self.tracer.take() {
            if let Err(e) = tracer.shutdown() {
                tracing::warn!(error = %e, "failed to flush spans");
            }
        }
        if let Some(meter) = self.meter.take() {
            if let Err(e) = meter.shutdown() {
                tracing::warn!(error = %e, "failed to flush metrics");
            }
        }
    }
}

/// Install the global subscriber, and the OTLP providers when configured
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = resource(&config.service_name);
    let tracer = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| otlp_tracer(endpoint, resource.clone()))
        .transpose()?;
    let meter = meter_provider(&config, resource)?;

    let otel_layer = tracer.as_ref().map(|tracer| {
        tracing_opentelemetry::layer().with_tracer(tracer.tracer(config.service_name.clone()))
    });

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    Ok(TelemetryGuard { tracer, meter })
}

/// Service identity plus the pod placement exposed through the downward API
fn resource(service_name: &str) -> Resource {
    let placement = [
        ("POD_NAME", "k8s.pod.name"),
        ("POD_NAMESPACE", "k8s.namespace.name"),
        ("NODE_NAME", "k8s.node.name"),
    ]
    .into_iter()
    .filter_map(|(env, key)| std::env::var(env).ok().map(|v| KeyValue::new(key, v)));

    Resource::new(
        [
            KeyValue::new(SERVICE_NAME, service_name.to_string()),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ]
        .into_iter()
        .chain(placement),
    )
}

fn otlp_tracer(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "span",
            message: e.to_string(),
        })?;
    let tracer = TracerProvider::builder()
        .with_batch_exporter(spans, runtime::Tokio)
        .with_resource(resource)
        .build();

    global::set_tracer_provider(tracer.clone());
    Ok(tracer)
}

/// Meter provider with a reader per configured sink, `None` without sinks
fn meter_provider(
    config: &TelemetryConfig,
    resource: Resource,
) -> Result<Option<SdkMeterProvider>, TelemetryError> {
    if config.otlp_endpoint.is_none() && config.prometheus.is_none() {
        return Ok(None);
    }

    let mut builder = SdkMeterProvider::builder().with_resource(resource);
    if let Some(endpoint) = config.otlp_endpoint.as_deref() {
        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| TelemetryError::Exporter {
                signal: "metric",
                message: e.to_string(),
            })?;
        builder = builder.with_reader(PeriodicReader::builder(metrics, runtime::Tokio).build());
    }
    if let Some(registry) = &config.prometheus {
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| TelemetryError::Exporter {
                signal: "prometheus",
                message: e.to_string(),
            })?;
        builder = builder.with_reader(exporter);
    }

    let meter = builder.build();
    global::set_meter_provider(meter.clone());
    Ok(Some(meter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_defaults_to_json() {
        assert_eq!(LogFormat::parse(None), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("json")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("bogus")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some(" TEXT ")), LogFormat::Text);
    }

    #[test]
    fn test_no_sinks_no_meter_provider() {
        let config = TelemetryConfig {
            service_name: "pxc-pitr".to_string(),
            otlp_endpoint: None,
            log_format: LogFormat::Json,
            prometheus: None,
        };
        assert!(meter_provider(&config, resource("pxc-pitr")).unwrap().is_none());
    }

    /// Story: a binary serving `/metrics` sees its counters in the registry
    /// it handed in
    #[test]
    fn story_prometheus_registry_receives_instruments() {
        use opentelemetry::metrics::MeterProvider as _;

        let registry = prometheus::Registry::new();
        let config = TelemetryConfig {
            service_name: "pxc-pitr".to_string(),
            otlp_endpoint: None,
            log_format: LogFormat::Json,
            prometheus: None,
        }
        .with_prometheus(registry.clone());

        let provider = meter_provider(&config, resource("pxc-pitr"))
            .unwrap()
            .unwrap();
        provider
            .meter("test")
            .u64_counter("pxc_test_uploads")
            .build()
            .add(2, &[]);

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name().starts_with("pxc_test_uploads")));
    }

    #[test]
    fn test_resource_carries_service_identity() {
        let resource = resource("pxc-pitr");
        assert_eq!(
            resource.get(SERVICE_NAME.into()).map(|v| v.to_string()),
            Some("pxc-pitr".to_string())
        );
        assert!(resource.get(SERVICE_VERSION.into()).is_some());
    }
}
