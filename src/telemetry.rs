//! Tracing subscriber and Datadog tracer provider for the binaries.

use anyhow::{Context, Result};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Keeps the tracer provider alive; spans are flushed when it is dropped.
pub struct Telemetry {
    provider: SdkTracerProvider,
}

/// Installs the global subscriber: an `EnvFilter` (`RUST_LOG`, default
/// `info`), the OpenTelemetry layer exporting to Datadog, and a fmt layer.
pub fn init(service_name: &str) -> Result<Telemetry> {
    let provider = datadog_opentelemetry::tracing()
        .with_config(
            datadog_opentelemetry::configuration::Config::builder()
                .set_service(service_name.to_string())
                .build(),
        )
        .init();

    global::set_tracer_provider(provider.clone());

    let telemetry_layer =
        tracing_opentelemetry::layer().with_tracer(provider.tracer(service_name.to_string()));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(telemetry_layer)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(Telemetry { provider })
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("⚠️  Failed to shut down tracer provider: {e}");
        }
    }
}
