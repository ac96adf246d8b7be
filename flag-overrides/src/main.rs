use std::time::Duration;

use envconfig::Envconfig;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use flag_overrides::config::Config;
use flag_overrides::server::serve;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

/// OTLP exporter for the spans of this service, batched on the tokio runtime.
fn otlp_tracer(config: &Config, sink_url: &str) -> Tracer {
    let trace_config = opentelemetry_sdk::trace::Config::default()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
            config.otel_sampling_rate,
        ))))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            config.otel_service_name.clone(),
        )]));

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(sink_url)
        .with_timeout(Duration::from_secs(config.otel_export_timeout_secs));

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(trace_config)
        .with_batch_config(BatchConfig::default())
        .with_exporter(exporter)
        .install_batch(runtime::Tokio)
        .expect("Failed to initialize OpenTelemetry tracer")
}

/// Log lines go to stdout, pretty under `DEBUG` and JSON otherwise, filtered by `RUST_LOG`.
/// Audit records use the `flag_overrides::audit` target, so they can be routed on their own.
/// Spans are also exported over OTLP when `OTEL_URL` is set.
fn init_tracing(config: &Config) {
    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);
    let log_layer = if *config.debug {
        log_layer.with_ansi(true).boxed()
    } else {
        log_layer.json().boxed()
    };

    let otel_layer = config.otel_url.as_deref().map(|sink_url| {
        OpenTelemetryLayer::new(otlp_tracer(config, sink_url))
            .with_filter(LevelFilter::from_level(config.otel_log_level))
    });

    tracing_subscriber::registry()
        .with(log_layer.with_filter(EnvFilter::from_default_env()))
        .with(otel_layer)
        .init();
}

#[tokio::main]
async fn main() {
    let config = Config::init_from_env().expect("Invalid configuration:");
    init_tracing(&config);

    let listener = tokio::net::TcpListener::bind(config.address)
        .await
        .expect("could not bind port");
    serve(config, listener, shutdown()).await;
}
