use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// OpenAI-compatible chat-completions base URL
    #[serde(default = "default_model_base_url")]
    pub model_base_url: String,

    /// API token for the model service
    pub model_api_key: String,

    /// Vision-capable model name
    #[serde(default = "default_model_name")]
    pub model_name: String,

    #[serde(default = "default_model_max_tokens")]
    pub model_max_tokens: u32,

    #[serde(default = "default_model_temperature")]
    pub model_temperature: f32,

    /// Hard per-call timeout in seconds
    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,

    /// Transport retry budget per extraction attempt
    #[serde(default = "default_transport_max_retries")]
    pub transport_max_retries: u32,

    #[serde(default = "default_transport_base_delay_ms")]
    pub transport_base_delay_ms: u64,

    /// Below this overall confidence a result triggers re-extraction
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: u8,

    #[serde(default = "default_confidence_max_attempts")]
    pub confidence_max_attempts: u32,

    #[serde(default = "default_confidence_base_delay_ms")]
    pub confidence_base_delay_ms: u64,

    #[serde(default = "default_confidence_backoff_multiplier")]
    pub confidence_backoff_multiplier: f64,

    #[serde(default = "default_confidence_max_delay_ms")]
    pub confidence_max_delay_ms: u64,

    #[serde(default = "default_confidence_jitter_fraction")]
    pub confidence_jitter_fraction: f64,

    /// Redis connection string for the durable cache tier. Optional: without
    /// it the pipeline runs on the in-process tier alone.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,

    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: u32,

    #[serde(default = "default_rate_limit_block_secs")]
    pub rate_limit_block_secs: u64,

    #[serde(default = "default_rate_limit_max_keys")]
    pub rate_limit_max_keys: usize,

    /// Concurrent model calls across all jobs
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_model_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model_name() -> String {
    "gpt-4o-mini".to_string()
}

fn default_model_max_tokens() -> u32 {
    1024
}

fn default_model_temperature() -> f32 {
    0.1
}

fn default_model_timeout_secs() -> u64 {
    30
}

fn default_transport_max_retries() -> u32 {
    3
}

fn default_transport_base_delay_ms() -> u64 {
    1000
}

fn default_confidence_threshold() -> u8 {
    70
}

fn default_confidence_max_attempts() -> u32 {
    3
}

fn default_confidence_base_delay_ms() -> u64 {
    2000
}

fn default_confidence_backoff_multiplier() -> f64 {
    2.0
}

fn default_confidence_max_delay_ms() -> u64 {
    30_000
}

fn default_confidence_jitter_fraction() -> f64 {
    0.1
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_max_entries() -> usize {
    1000
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_rate_limit_max_requests() -> u32 {
    30
}

fn default_rate_limit_block_secs() -> u64 {
    60
}

fn default_rate_limit_max_keys() -> usize {
    10_000
}

fn default_worker_concurrency() -> usize {
    3
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}
