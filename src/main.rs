mod auth;
mod config;
mod error;
mod handlers;
mod mapping;
mod metrics;
mod models;
mod route;
mod state;
mod streaming;
mod tracing_otlp;
mod translate;

use anyhow::Context;
use axum::Router;
use metrics::{init_metrics, init_metrics_noop};
use opentelemetry::trace::TracerProvider as _;
use tracing_otlp::{init_tracer, init_tracer_noop, spawn_tracer_watchdog};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::Config;
use crate::state::AppState;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

fn parse_level(level: &str) -> LevelFilter {
    match level {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

fn open_log_file(path: &str) -> Option<std::fs::File> {
    let path = Path::new(path);
    if let Some(parent) = path.parent()
        && let Err(err) = std::fs::create_dir_all(parent)
    {
        eprintln!("log file create dir error: {}", err);
        return None;
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("log file open error: {}", err);
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()
        .map_err(anyhow::Error::msg)
        .context("config error")?;

    let inflight_count = Arc::new(AtomicU64::new(0));
    let metrics = match init_metrics(&config.observability, inflight_count.clone()) {
        Ok(m) => m,
        Err(err) => {
            eprintln!("metrics init error (fallback to noop): {}", err);
            init_metrics_noop(inflight_count.clone())
        }
    };
    let tracer_provider = match init_tracer(&config.observability) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("tracing init error (fallback to noop): {}", err);
            init_tracer_noop(config.observability.service_name.clone())
        }
    };

    let logging = &config.observability.logging;
    let file_writer = logging.file.as_deref().and_then(open_log_file).map(Arc::new);
    let writer = match (logging.stdout, file_writer) {
        (true, Some(file)) => BoxMakeWriter::new(std::io::stdout.and(file)),
        (true, None) => BoxMakeWriter::new(std::io::stdout),
        (false, Some(file)) => BoxMakeWriter::new(file),
        (false, None) => BoxMakeWriter::new(std::io::stdout),
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_filter(parse_level(logging.level.as_str()));

    let telemetry = tracing_opentelemetry::layer()
        .with_tracer(tracer_provider.tracer(config.observability.service_name.clone()));
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(telemetry)
        .init();

    tracing::info!(
        tracing_exporter = %config.observability.exporters.tracing,
        metrics_exporter = %config.observability.exporters.metrics,
        backend = %config.backend.base_url,
        "observability configured"
    );

    let _tracer_watchdog = spawn_tracer_watchdog(tracer_provider.clone());

    let bind_addr = config.server.bind_addr.clone();
    let state = AppState::new(config, metrics, inflight_count).context("client build error")?;
    if !state.guard.is_enabled() {
        tracing::warn!("API_KEY is not set; requests are not authenticated");
    }
    let app = Router::new().fallback(handlers::proxy).with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind error on {}", bind_addr))?;

    tracing::info!("listening on {}", bind_addr);
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
