use opentelemetry::metrics::{Counter, Histogram, MeterProvider, ObservableGauge};
use opentelemetry_otlp::{MetricExporter, Protocol, WithExportConfig, WithHttpConfig, WithTonicConfig};
use opentelemetry_sdk::metrics::periodic_reader_with_async_runtime::PeriodicReader;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::Resource;
use std::sync::{atomic::AtomicU64, Arc};
use std::time::Duration;

use crate::config::ObservabilityConfig;
use crate::tracing_otlp::{grpc_metadata, http_headers};

const METER_NAME: &str = "genai-gateway";

#[derive(Clone)]
pub struct Metrics {
    pub requests: Counter<u64>,
    pub errors: Counter<u64>,
    pub stream_diagnostics: Counter<u64>,
    pub latency_ms: Histogram<f64>,
    _inflight: ObservableGauge<i64>,
}

pub fn init_metrics(
    observability: &ObservabilityConfig,
    inflight_count: Arc<AtomicU64>,
) -> Result<Metrics, String> {
    let exporter = match observability.exporters.metrics.as_str() {
        "otlp_http" => {
            let http = &observability.otlp_http;
            MetricExporter::builder()
                .with_http()
                .with_endpoint(http.metrics_endpoint())
                .with_protocol(Protocol::HttpBinary)
                .with_timeout(Duration::from_millis(http.timeout_ms))
                .with_headers(http_headers(http))
                .build()
                .map_err(|e| format!("metrics exporter init error: {}", e))?
        }
        "otlp_grpc" => {
            let grpc = &observability.otlp_grpc;
            MetricExporter::builder()
                .with_tonic()
                .with_endpoint(grpc.endpoint.clone())
                .with_protocol(Protocol::Grpc)
                .with_timeout(Duration::from_millis(grpc.timeout_ms))
                .with_metadata(grpc_metadata(&grpc.headers)?)
                .build()
                .map_err(|e| format!("metrics exporter init error: {}", e))?
        }
        _ => return Ok(init_metrics_noop(inflight_count)),
    };

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(
            Resource::builder()
                .with_service_name(observability.service_name.clone())
                .build(),
        )
        .build();

    let meter = provider.meter(METER_NAME);
    opentelemetry::global::set_meter_provider(provider);

    Ok(build_instruments(&meter, inflight_count))
}

pub fn init_metrics_noop(inflight_count: Arc<AtomicU64>) -> Metrics {
    let meter = opentelemetry::global::meter(METER_NAME);
    build_instruments(&meter, inflight_count)
}

fn build_instruments(meter: &opentelemetry::metrics::Meter, inflight_count: Arc<AtomicU64>) -> Metrics {
    let requests = meter
        .u64_counter("genai.gateway.requests")
        .with_description("Total requests by route kind and action")
        .build();
    let errors = meter
        .u64_counter("genai.gateway.errors")
        .with_description("Total errors by kind")
        .build();
    let stream_diagnostics = meter
        .u64_counter("genai.gateway.stream_diagnostics")
        .with_description("Stream chunks replaced by an inline diagnostic")
        .build();
    let latency_ms = meter
        .f64_histogram("genai.gateway.latency_ms")
        .with_unit("ms")
        .with_description("Request latency in ms")
        .build();
    let inflight = meter
        .i64_observable_gauge("genai.gateway.inflight")
        .with_description("In-flight requests")
        .with_callback(move |observer| {
            let value = inflight_count.load(std::sync::atomic::Ordering::Relaxed) as i64;
            observer.observe(value, &[]);
        })
        .build();

    Metrics {
        requests,
        errors,
        stream_diagnostics,
        latency_ms,
        _inflight: inflight,
    }
}
