use clap::ValueEnum;
use opentelemetry::trace::{TraceContextExt, TraceId, TracerProvider as _};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use thiserror::Error;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const SERVICE_NAME: &str = "pixop";

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("invalid log filter `{0}`: {1}")]
    InvalidFilter(String, #[source] tracing_subscriber::filter::ParseError),

    #[error("failed to build OpenTelemetry exporter: {0}")]
    Exporter(#[source] opentelemetry_otlp::ExporterBuildError),

    #[error("failed to initialize tracing subscriber: {0}")]
    Subscriber(#[source] tracing_subscriber::util::TryInitError),
}

/// Trace id of the current span, [`TraceId::INVALID`] when tracing export is disabled.
pub fn get_trace_id() -> TraceId {
    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

fn init_tracer_provider(
    url: &str,
    sample_ratio: f64,
) -> Result<SdkTracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(url)
        .build()
        .map_err(TelemetryError::Exporter)?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            sample_ratio,
        ))))
        .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
        .build())
}

/// Initialize the global tracing subscriber: env filter, text or JSON logs, and span export
/// through OTLP when `tracing_url` is set.
pub async fn init(
    log_filter: &str,
    log_format: LogFormat,
    tracing_url: Option<&str>,
    sample_ratio: f64,
) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_new(log_filter)
        .map_err(|e| TelemetryError::InvalidFilter(log_filter.to_string(), e))?;

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match log_format {
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .boxed(),
    };

    let otel_layer = match tracing_url {
        Some(url) => {
            let provider = init_tracer_provider(url, sample_ratio)?;
            let tracer = provider.tracer(SERVICE_NAME);
            opentelemetry::global::set_tracer_provider(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(otel_layer)
        .with(filter)
        .try_init()
        .map_err(TelemetryError::Subscriber)
}
