//! # Telemetry
//!
//! Console logging is always on (via `tracing_subscriber::fmt`, filtered by
//! `RUST_LOG`, default `info`). The broker's own log statements are compiled
//! in with the `tracing` feature. OpenTelemetry export is layered on top:
//!
//! ## Feature matrix
//!
//! - `tracing`: Broker log events plus OpenTelemetry span export.
//! - `metrics`: OpenTelemetry metrics for requests, units and acks.
//! - `honeycomb`: Honeycomb OTLP exporter (gRPC, TLS).
//! - `stdout`: stdout OTLP exporter, useful for local debugging.
//!
//! ## Feature constraints
//!
//! - Exporters require at least one of `tracing` or `metrics`.
//! - `honeycomb` and `stdout` may be enabled together.
//!
//! ## Metrics
//!
//! | name                 | kind           | meaning                              |
//! |----------------------|----------------|--------------------------------------|
//! | `requests`           | counter        | client requests accepted             |
//! | `units_dispatched`   | counter        | work units sent to workers           |
//! | `acks`               | counter        | worker acks folded into requests     |
//! | `replies`            | counter        | replies sent to clients              |
//! | `protocol_errors`    | counter        | malformed or unroutable messages     |
//! | `workers_registered` | counter        | worker registrations                 |
//! | `requests_inflight`  | up/down        | requests awaiting their reply        |
//! | `units_pending`      | up/down        | units waiting for a worker           |
//! | `request_duration`   | histogram (ms) | request arrival to reply             |
//! | `units_per_request`  | histogram      | fragments per client request         |
//!
//! Pending and in-flight state is unbounded; the two up/down counters are the
//! way to watch it.
//!
//! ## Example usage
//!
//! ```bash
//! cargo run --features tracing,metrics,stdout -- --task-types upper
//! HONEYCOMB_API_KEY=... cargo run --features tracing,honeycomb -- --task-types upper
//! ```

#[cfg(all(
    feature = "honeycomb",
    not(any(feature = "tracing", feature = "metrics"))
))]
compile_error!(
    "The 'honeycomb' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};
#[cfg(all(feature = "honeycomb", feature = "metrics"))]
use opentelemetry_sdk::metrics::Temporality;
#[cfg(feature = "honeycomb")]
use tonic::metadata::MetadataMap;
#[cfg(all(feature = "honeycomb", any(feature = "metrics", feature = "tracing")))]
use tonic::transport::ClientTlsConfig;

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "taskbroker";

/// Console log layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Multi-line, human-readable output with source locations.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON, for log shippers.
    Json,
}

/// Exporter handles that must be flushed before the process exits.
pub struct TelemetryProviders {
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every exporter. Errors are printed to stderr
    /// because the subscriber may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

/// Installs the global subscriber and any enabled exporters.
///
/// # Errors
///
/// Fails if an exporter cannot be built, for example when the Honeycomb
/// environment variables are missing.
pub fn init_telemetry(format: LogFormat) -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer()?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics()?;

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let timer = fmt::time::ChronoLocal::rfc_3339();
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with((format == LogFormat::Pretty).then(|| {
            fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(timer.clone())
                .with_file(true)
                .pretty()
        }))
        .with((format == LogFormat::Compact).then(|| {
            fmt::layer()
                .with_target(false)
                .with_timer(timer.clone())
                .compact()
        }))
        .with((format == LogFormat::Json).then(|| {
            fmt::layer()
                .with_thread_ids(true)
                .with_timer(timer.clone())
                .json()
        }));

    #[cfg(feature = "tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(&meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

/// Connection settings shared by the Honeycomb span and metric exporters.
#[cfg(feature = "honeycomb")]
struct HoneycombSettings {
    metadata: MetadataMap,
    endpoint: String,
    compression: Compression,
}

#[cfg(feature = "honeycomb")]
impl HoneycombSettings {
    fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        use std::str::FromStr;

        let var = |name: &str| std::env::var(name).with_context(|| format!("missing `{name}`"));

        let mut metadata = MetadataMap::new();
        metadata.insert(
            "x-honeycomb-team",
            var("HONEYCOMB_API_KEY")?.parse().context("invalid API key")?,
        );
        metadata.insert(
            "x-honeycomb-dataset",
            var("HONEYCOMB_DATASET")?.parse().context("invalid dataset")?,
        );

        Ok(Self {
            metadata,
            endpoint: var("HONEYCOMB_ENDPOINT")?,
            compression: Compression::from_str(
                &var("HONEYCOMB_COMPRESSION")?.to_ascii_lowercase(),
            )?,
        })
    }
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        let exporter = opentelemetry_stdout::MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();
        builder.with_reader(reader)
    };

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let settings = HoneycombSettings::from_env()?;
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(settings.compression)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .with_temporality(Temporality::Delta)
            .build()
            .context("failed to build metrics exporter")?;
        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "tracing")]
fn init_tracer() -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = builder.with_span_processor(batch_processor(
        opentelemetry_stdout::SpanExporter::default(),
    ));

    #[cfg(feature = "honeycomb")]
    let builder = {
        use anyhow::Context;

        let settings = HoneycombSettings::from_env()?;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_tls_config(ClientTlsConfig::new().with_native_roots())
            .with_metadata(settings.metadata)
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(settings.compression)
            .with_endpoint(settings.endpoint)
            .with_protocol(Protocol::Grpc)
            .build()
            .context("failed to build tracer exporter")?;
        builder.with_span_processor(batch_processor(exporter))
    };

    Ok(builder.build())
}

#[cfg(all(feature = "tracing", any(feature = "stdout", feature = "honeycomb")))]
fn batch_processor<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: opentelemetry_sdk::trace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

#[cfg(feature = "metrics")]
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static UNITS_DISPATCHED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static ACKS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REPLIES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static PROTOCOL_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static WORKERS_REGISTERED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUESTS_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static UNITS_PENDING: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUEST_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static UNITS_PER_REQUEST: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let counter = |name: &'static str, description: &'static str| {
        meter.u64_counter(name).with_description(description).build()
    };
    let _ = REQUESTS.set(counter("requests", "Client requests accepted"));
    let _ = UNITS_DISPATCHED.set(counter("units_dispatched", "Work units sent to workers"));
    let _ = ACKS.set(counter("acks", "Worker acks folded into requests"));
    let _ = REPLIES.set(counter("replies", "Replies sent to clients"));
    let _ = PROTOCOL_ERRORS.set(counter("protocol_errors", "Malformed or unroutable messages"));
    let _ = WORKERS_REGISTERED.set(counter("workers_registered", "Worker registrations"));

    let _ = REQUESTS_INFLIGHT.set(
        meter
            .i64_up_down_counter("requests_inflight")
            .with_description("Requests awaiting their reply")
            .build(),
    );
    let _ = UNITS_PENDING.set(
        meter
            .i64_up_down_counter("units_pending")
            .with_description("Units waiting for a worker")
            .build(),
    );

    let _ = REQUEST_DURATION_MS.set(
        meter
            .f64_histogram("request_duration")
            .with_unit("ms")
            .with_description("Request arrival to reply")
            .build(),
    );
    let _ = UNITS_PER_REQUEST.set(
        meter
            .f64_histogram("units_per_request")
            .with_description("Fragments per client request")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled

#[cfg(feature = "metrics")]
fn add(counter: &OnceLock<Counter<u64>>, value: u64) {
    if let Some(counter) = counter.get() {
        counter.add(value, &[]);
    }
}

#[cfg(feature = "metrics")]
fn adjust(counter: &OnceLock<UpDownCounter<i64>>, delta: i64) {
    if let Some(counter) = counter.get() {
        counter.add(delta, &[]);
    }
}

#[cfg(feature = "metrics")]
pub fn increment_requests() {
    add(&REQUESTS, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests() {}

#[cfg(feature = "metrics")]
pub fn increment_units_dispatched(count: u64) {
    add(&UNITS_DISPATCHED, count);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_units_dispatched(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_acks() {
    add(&ACKS, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_acks() {}

#[cfg(feature = "metrics")]
pub fn increment_replies() {
    add(&REPLIES, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_replies() {}

#[cfg(feature = "metrics")]
pub fn increment_protocol_errors() {
    add(&PROTOCOL_ERRORS, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_protocol_errors() {}

#[cfg(feature = "metrics")]
pub fn increment_workers_registered() {
    add(&WORKERS_REGISTERED, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_workers_registered() {}

#[cfg(feature = "metrics")]
pub fn increment_requests_inflight() {
    adjust(&REQUESTS_INFLIGHT, 1);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests_inflight() {}

#[cfg(feature = "metrics")]
pub fn decrement_requests_inflight() {
    adjust(&REQUESTS_INFLIGHT, -1);
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_requests_inflight() {}

#[cfg(feature = "metrics")]
#[allow(clippy::cast_possible_wrap)]
pub fn increment_units_pending(count: u64) {
    adjust(&UNITS_PENDING, count as i64);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_units_pending(_count: u64) {}

#[cfg(feature = "metrics")]
#[allow(clippy::cast_possible_wrap)]
pub fn decrement_units_pending(count: u64) {
    adjust(&UNITS_PENDING, -(count as i64));
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_units_pending(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn record_request_duration(duration_ms: f64) {
    if let Some(histogram) = REQUEST_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_request_duration(_duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn record_units_per_request(count: f64) {
    if let Some(histogram) = UNITS_PER_REQUEST.get() {
        histogram.record(count, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_units_per_request(_count: f64) {}
