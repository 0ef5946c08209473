//! Logging and OpenTelemetry export for the operator process
//!
//! Logs always go to stdout as JSON. When an OTLP endpoint is configured the
//! reconcile spans and the instruments in [`crate::metrics`] are exported to
//! it as well; without one the instruments record into the no-op global
//! meter provider and cost nothing.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{Error, POD_NAME_ENV};

/// Name the operator reports its spans and metrics under
pub const SERVICE: &str = "accel-operator";

/// Environment variable naming the OTLP collector
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "info,accel=debug,kube=info,tower=warn,hyper=warn";

/// Where the operator's telemetry goes
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// OTLP collector, e.g. `http://otel-collector:4317`
    pub otlp_endpoint: Option<String>,
    /// Namespace the operator runs in, attached to exported telemetry
    pub namespace: Option<String>,
}

impl TelemetryConfig {
    /// Read the collector endpoint from the environment
    pub fn from_env(namespace: Option<String>) -> Self {
        Self {
            otlp_endpoint: std::env::var(OTLP_ENDPOINT_ENV)
                .ok()
                .filter(|e| !e.trim().is_empty()),
            namespace,
        }
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new(SERVICE_NAME, SERVICE),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ];
        if let Some(namespace) = &self.namespace {
            attributes.push(KeyValue::new("k8s.namespace.name", namespace.clone()));
        }
        if let Ok(pod) = std::env::var(POD_NAME_ENV) {
            attributes.push(KeyValue::new("k8s.pod.name", pod));
        }
        Resource::new(attributes)
    }
}

/// Install the global subscriber and, when configured, the OTLP exporters
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), Error> {
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = config.resource();
            install_meter_provider(endpoint, resource.clone())?;
            let tracer = install_tracer_provider(endpoint, resource)?.tracer(SERVICE);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(log_filter())
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::configuration("RUST_LOG", e.to_string()))
}

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn install_tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, Error> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::configuration(OTLP_ENDPOINT_ENV, e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

fn install_meter_provider(endpoint: &str, resource: Resource) -> Result<(), Error> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| Error::configuration(OTLP_ENDPOINT_ENV, e.to_string()))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    global::set_meter_provider(
        SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource)
            .build(),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::Key;

    #[test]
    fn default_filter_quiets_transport_noise() {
        assert!(DEFAULT_LOG_FILTER.contains("accel=debug"));
        assert!(DEFAULT_LOG_FILTER.contains("hyper=warn"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn resource_names_the_operator_and_its_namespace() {
        let config = TelemetryConfig {
            otlp_endpoint: None,
            namespace: Some("xdxct-gpu-operator".to_string()),
        };
        let resource = config.resource();
        assert_eq!(
            resource.get(Key::from_static_str(SERVICE_NAME)),
            Some(SERVICE.into())
        );
        assert_eq!(
            resource.get(Key::from_static_str("k8s.namespace.name")),
            Some("xdxct-gpu-operator".into())
        );
    }

    #[test]
    fn resource_without_namespace_omits_it() {
        let resource = TelemetryConfig::default().resource();
        assert!(resource
            .get(Key::from_static_str("k8s.namespace.name"))
            .is_none());
    }
}
