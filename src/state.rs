use crate::auth::AuthGuard;
use crate::config::Config;
use crate::metrics::Metrics;
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub config: Arc<Config>,
    pub guard: AuthGuard,
    pub inflight: Arc<Semaphore>,
    pub inflight_count: Arc<AtomicU64>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: Config, metrics: Metrics, inflight_count: Arc<AtomicU64>) -> Result<Self, reqwest::Error> {
        // No overall timeout on the shared client: streamed generations are unbounded.
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.backend.pool_max_idle_per_host)
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            client,
            guard: AuthGuard::new(config.api_key()),
            inflight: Arc::new(Semaphore::new(config.limits.max_inflight)),
            inflight_count,
            metrics,
            config: Arc::new(config),
        })
    }

    pub fn try_acquire(&self) -> Option<InflightGuard> {
        self.inflight
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| InflightGuard::new(permit, self.inflight_count.clone()))
    }
}

pub struct InflightGuard {
    _permit: OwnedSemaphorePermit,
    counter: Arc<AtomicU64>,
}

impl InflightGuard {
    pub fn new(permit: OwnedSemaphorePermit, counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { _permit: permit, counter }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
