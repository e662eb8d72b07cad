use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub translate: TranslateConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    // Applied to non-stream calls only; a streamed generation may run arbitrarily long.
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_base_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TranslateConfig {
    // Treat an explicit zero sampling parameter as absent.
    #[serde(default)]
    pub zero_means_unset: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub dump_bodies: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub otlp_grpc: OtlpGrpcConfig,
    #[serde(default)]
    pub otlp_http: OtlpHttpConfig,
    #[serde(default)]
    pub exporters: ExportersConfig,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            dump_bodies: false,
            logging: LoggingConfig::default(),
            otlp_grpc: OtlpGrpcConfig::default(),
            otlp_http: OtlpHttpConfig::default(),
            exporters: ExportersConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtlpGrpcConfig {
    #[serde(default = "default_otlp_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_otlp_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for OtlpGrpcConfig {
    fn default() -> Self {
        Self {
            endpoint: default_otlp_endpoint(),
            timeout_ms: default_otlp_timeout_ms(),
            headers: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtlpHttpConfig {
    #[serde(default = "default_otlp_http_base_url")]
    pub base_url: String,
    #[serde(default = "default_otlp_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
}

impl Default for OtlpHttpConfig {
    fn default() -> Self {
        Self {
            base_url: default_otlp_http_base_url(),
            timeout_ms: default_otlp_timeout_ms(),
            headers: HashMap::new(),
            basic_auth: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExportersConfig {
    #[serde(default = "default_exporter_kind")]
    pub tracing: String,
    #[serde(default = "default_exporter_kind")]
    pub metrics: String,
}

impl Default for ExportersConfig {
    fn default() -> Self {
        Self {
            tracing: default_exporter_kind(),
            metrics: default_exporter_kind(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_stdout")]
    pub stdout: bool,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stdout: default_log_stdout(),
            file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let mut config = match std::env::var("CONFIG_PATH") {
            Ok(path) => {
                let content = fs::read_to_string(&path)
                    .map_err(|e| format!("CONFIG_PATH read error: {}", e))?;
                Self::from_yaml(&content)?
            }
            Err(_) => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        config.normalize()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, String> {
        serde_yaml::from_str(content).map_err(|e| format!("CONFIG_PATH invalid yaml: {}", e))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT").filter(|p| !p.is_empty()) {
            let host = self
                .server
                .bind_addr
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.server.bind_addr = format!("{}:{}", host, port);
        }
        if let Some(base_url) = lookup("OLLAMA_HOST").filter(|u| !u.is_empty()) {
            self.backend.base_url = base_url;
        }
        if let Some(api_key) = lookup("API_KEY").filter(|k| !k.is_empty()) {
            self.auth.api_key = Some(api_key);
        }
    }

    pub fn backend_url(&self, path: &str, query: Option<&str>) -> String {
        let base = self.backend.base_url.trim_end_matches('/');
        match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", base, path, q),
            _ => format!("{}{}", base, path),
        }
    }

    pub fn api_key(&self) -> Option<String> {
        self.auth.api_key.clone().filter(|k| !k.is_empty())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.backend.read_timeout_ms.map(Duration::from_millis)
    }

    fn normalize(&mut self) -> Result<(), String> {
        let base = self.backend.base_url.trim();
        let parsed: axum::http::Uri = base
            .parse()
            .map_err(|e| format!("backend.base_url invalid: {}", e))?;
        match parsed.scheme_str() {
            Some("http") | Some("https") => {}
            _ => return Err(format!("backend.base_url must be an http(s) URL: {}", base)),
        }
        if parsed.host().is_none() {
            return Err(format!("backend.base_url has no host: {}", base));
        }
        self.backend.base_url = base.trim_end_matches('/').to_string();

        if self.limits.max_inflight == 0 {
            return Err("limits.max_inflight must be greater than 0".to_string());
        }
        if self.limits.stream_buffer == 0 {
            return Err("limits.stream_buffer must be greater than 0".to_string());
        }

        self.observability.logging.level = self.observability.logging.level.to_lowercase();
        match self.observability.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(format!("logging.level invalid: {}", other)),
        }
        for kind in [
            &self.observability.exporters.tracing,
            &self.observability.exporters.metrics,
        ] {
            match kind.as_str() {
                "otlp_grpc" | "otlp_http" | "none" => {}
                other => return Err(format!("exporter kind invalid: {}", other)),
            }
        }
        Ok(())
    }
}

impl OtlpHttpConfig {
    pub fn traces_endpoint(&self) -> String {
        format!("{}/v1/traces", self.base_url.trim_end_matches('/'))
    }

    pub fn metrics_endpoint(&self) -> String {
        format!("{}/v1/metrics", self.base_url.trim_end_matches('/'))
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_backend_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_pool_max_idle_per_host() -> usize {
    64
}

fn default_max_inflight() -> usize {
    512
}

fn default_stream_buffer() -> usize {
    16
}

fn default_service_name() -> String {
    "genai-gateway".to_string()
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otlp_http_base_url() -> String {
    "http://localhost:4318".to_string()
}

fn default_otlp_timeout_ms() -> u64 {
    3000
}

fn default_exporter_kind() -> String {
    "none".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_stdout() -> bool {
    true
}
