use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::Engine;
use opentelemetry::global;
use opentelemetry_otlp::{Protocol, SpanExporter, WithExportConfig, WithHttpConfig, WithTonicConfig};
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::span_processor_with_async_runtime::BatchSpanProcessor;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tonic::metadata::MetadataMap;
use tracing::warn;

use crate::config::{ObservabilityConfig, OtlpHttpConfig};

pub fn init_tracer(observability: &ObservabilityConfig) -> Result<SdkTracerProvider, String> {
    let exporter = match observability.exporters.tracing.as_str() {
        "otlp_grpc" => {
            let grpc = &observability.otlp_grpc;
            SpanExporter::builder()
                .with_tonic()
                .with_endpoint(grpc.endpoint.clone())
                .with_timeout(Duration::from_millis(grpc.timeout_ms))
                .with_metadata(grpc_metadata(&grpc.headers)?)
                .build()
                .map_err(|e| format!("trace exporter init error: {}", e))?
        }
        "otlp_http" => {
            let http = &observability.otlp_http;
            SpanExporter::builder()
                .with_http()
                .with_endpoint(http.traces_endpoint())
                .with_protocol(Protocol::HttpBinary)
                .with_timeout(Duration::from_millis(http.timeout_ms))
                .with_headers(http_headers(http))
                .build()
                .map_err(|e| format!("trace exporter init error: {}", e))?
        }
        _ => return Ok(init_tracer_noop(observability.service_name.clone())),
    };

    let batch = BatchSpanProcessor::builder(exporter, runtime::Tokio).build();
    let provider = SdkTracerProvider::builder()
        .with_span_processor(batch)
        .with_resource(
            Resource::builder()
                .with_service_name(observability.service_name.clone())
                .build(),
        )
        .build();

    hold_tracer_provider(provider.clone());
    Ok(provider)
}

pub fn init_tracer_noop(service_name: String) -> SdkTracerProvider {
    let provider = SdkTracerProvider::builder()
        .with_resource(Resource::builder().with_service_name(service_name).build())
        .build();
    hold_tracer_provider(provider.clone());
    provider
}

pub fn http_headers(config: &OtlpHttpConfig) -> HashMap<String, String> {
    let mut headers = config.headers.clone();
    if let Some(auth) = &config.basic_auth {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", auth.username, auth.password));
        headers.insert("Authorization".to_string(), format!("Basic {}", encoded));
    }
    headers
}

pub fn grpc_metadata(headers: &HashMap<String, String>) -> Result<MetadataMap, String> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes())
            .map_err(|e| format!("otlp_grpc header name {:?} invalid: {}", name, e))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| format!("otlp_grpc header value for {} invalid: {}", name, e))?;
        map.insert(name, value);
    }
    Ok(MetadataMap::from_headers(map))
}

fn hold_tracer_provider(provider: SdkTracerProvider) {
    static GLOBAL_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();
    let _ = GLOBAL_PROVIDER.set(provider.clone());
    global::set_tracer_provider(provider);
}

pub fn spawn_tracer_watchdog(provider: SdkTracerProvider) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(30));
        if let Err(err) = provider.force_flush() {
            warn!(
                "tracer provider force_flush failed (batch worker may be down): {}",
                err
            );
        }
    })
}
