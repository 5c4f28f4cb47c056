use opentelemetry::trace::TraceId;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("A global subscriber is already installed: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("Failed to create OTLP span exporter: {0}")]
    Exporter(String),
}

/// How the operator logs and traces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Reported as the OTel service name and tracer name
    pub service_name: String,
    /// Filter directives used when RUST_LOG is unset
    pub default_filter: String,
    /// One json object per line instead of compact text
    pub json: bool,
    /// Export spans to this OTLP collector; needs the `telemetry` feature
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "elasticsearch-operator".into(),
            default_filter: "info".into(),
            json: false,
            otlp_endpoint: None,
        }
    }
}

/// Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> Option<TraceId> {
    use opentelemetry::trace::TraceContextExt as _; // opentelemetry::Context -> opentelemetry::trace::Span
    use tracing_opentelemetry::OpenTelemetrySpanExt as _; // tracing::Span to opentelemetry::Context

    match tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
    {
        TraceId::INVALID => None,
        valid => Some(valid),
    }
}

fn default_filter(directives: &str) -> Result<EnvFilter, TelemetryError> {
    Ok(EnvFilter::try_new(directives)?)
}

#[cfg(feature = "telemetry")]
fn init_tracer_provider(
    service_name: &str,
    endpoint: &str,
) -> Result<opentelemetry_sdk::trace::SdkTracerProvider, TelemetryError> {
    use opentelemetry_otlp::{SpanExporter, WithExportConfig};
    use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};

    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|err| TelemetryError::Exporter(err.to_string()))?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_string())
                .build(),
        )
        .build())
}

/// Install the global tracing subscriber
pub fn init(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => default_filter(&config.default_filter)?,
    };

    let json = config.json.then(|| fmt::layer().json());
    let compact = (!config.json).then(|| fmt::layer().compact());
    let collector = Registry::default().with(json).with(compact).with(env_filter);

    #[cfg(feature = "telemetry")]
    let collector = {
        use opentelemetry::trace::TracerProvider;
        let telemetry = match config.otlp_endpoint.as_deref() {
            Some(endpoint) => {
                let provider = init_tracer_provider(&config.service_name, endpoint)?;
                let tracer = provider.tracer(config.service_name.clone());
                // Set the global tracer provider so it stays alive
                opentelemetry::global::set_tracer_provider(provider);
                Some(tracing_opentelemetry::layer().with_tracer(tracer))
            }
            None => None,
        };
        collector.with(telemetry)
    };

    tracing::subscriber::set_global_default(collector)?;

    #[cfg(not(feature = "telemetry"))]
    if let Some(endpoint) = &config.otlp_endpoint {
        tracing::warn!("Built without the telemetry feature, not exporting spans to {endpoint}");
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_trace_id_outside_a_traced_span() {
        assert_eq!(get_trace_id(), None);
    }

    #[test]
    fn default_config_logs_compact_info() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "elasticsearch-operator");
        assert_eq!(config.default_filter, "info");
        assert!(!config.json);
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn default_filter_accepts_per_target_levels() {
        assert!(default_filter("info,elasticsearch_operator=debug,kube=warn").is_ok());
    }

    #[test]
    fn invalid_default_filter_is_an_error() {
        assert!(matches!(
            default_filter("elasticsearch_operator=loud"),
            Err(TelemetryError::Filter(_))
        ));
    }
}
