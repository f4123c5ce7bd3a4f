//! Logging and OpenTelemetry setup for the binary.
//!
//! Logs go to stderr, filtered by `RUST_LOG` (or [`DEFAULT_LOG_DIRECTIVES`]).
//! An OpenTelemetry layer is always installed so that chat spans carry real W3C
//! trace ids. Spans are only exported when OTLP export is enabled.

use anyhow::{Result, anyhow};
use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub const DEFAULT_LOG_DIRECTIVES: &str = "warn,dataset_evaluations=info,langfuse_client=info";
/// Setting this enables OTLP export even without `--otlp`.
pub const OTLP_TRACES_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_TRACES_ENDPOINT";
const SERVICE_NAME: &str = "dataset-evaluations";
const TRACER_NAME: &str = "dataset-evaluations";

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[clap(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Keeps the tracer provider alive; call [`ObservabilityHandle::shutdown`] before
/// exiting so buffered spans are exported.
pub struct ObservabilityHandle {
    provider: SdkTracerProvider,
    pub otlp_export: bool,
}

impl ObservabilityHandle {
    pub async fn shutdown(self) -> Result<()> {
        let provider = self.provider;
        tokio::task::spawn_blocking(move || {
            tracing::debug!("Shutting down tracer provider");
            provider
                .shutdown()
                .map_err(|e| anyhow!("Failed to shutdown OpenTelemetry: {e}"))
        })
        .await
        .map_err(|e| anyhow!("Failed to wait on OpenTelemetry shutdown: {e}"))?
    }
}

/// Builds a tracer provider. Without `otlp_export` spans are created (and get
/// trace ids) but are not exported anywhere.
pub fn build_tracer_provider(otlp_export: bool) -> Result<SdkTracerProvider> {
    let mut builder = SdkTracerProvider::builder().with_resource(
        Resource::builder_empty()
            .with_attribute(KeyValue::new("service.name", SERVICE_NAME))
            .build(),
    );
    if otlp_export {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .build()
            .map_err(|e| anyhow!("Failed to create OTLP exporter: {e}"))?;
        builder = builder.with_batch_exporter(exporter);
    }
    Ok(builder.build())
}

fn log_filter() -> Result<EnvFilter> {
    let env_var_name = "RUST_LOG";
    if std::env::var(env_var_name).is_ok() {
        EnvFilter::builder()
            .with_env_var(env_var_name)
            .from_env()
            .map_err(|e| anyhow!("Invalid `{env_var_name}` environment variable: {e}"))
    } else {
        EnvFilter::builder()
            .parse(DEFAULT_LOG_DIRECTIVES)
            .map_err(|e| anyhow!("Failed to parse default log directives: {e}"))
    }
}

/// Installs the global subscriber. Must run inside a Tokio runtime when OTLP
/// export is enabled.
pub fn setup_observability(log_format: LogFormat, otlp: bool) -> Result<ObservabilityHandle> {
    let otlp_export = otlp || std::env::var_os(OTLP_TRACES_ENDPOINT_ENV).is_some();
    let log_layer = match log_format {
        LogFormat::Pretty => Box::new(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            as Box<dyn Layer<Registry> + Send + Sync>,
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        ),
    };

    let provider = build_tracer_provider(otlp_export)?;
    let otel_layer = tracing_opentelemetry::layer()
        .with_tracer(provider.tracer(TRACER_NAME))
        .with_filter(
            Targets::new()
                .with_target("dataset_evaluations", Level::INFO)
                .with_target("langfuse_client", Level::INFO),
        );

    tracing_subscriber::registry()
        .with(log_layer.with_filter(log_filter()?))
        .with(otel_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize tracing: {e}"))?;

    Ok(ObservabilityHandle {
        provider,
        otlp_export,
    })
}
