mod app_state;
mod config;
mod models;
mod routes;
mod services;

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::AppConfig;
use services::cache::ResultCache;
use services::model::VisionModelClient;
use services::orchestrator::{ExtractionOrchestrator, OrchestratorConfig};
use services::rate_limit::RateLimiter;
use services::retry::RetryPolicy;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing attribute-extract server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!(
        "extraction_jobs_submitted",
        "Total extraction jobs submitted"
    );
    metrics::describe_counter!(
        "extraction_jobs_completed",
        "Total extraction jobs completed"
    );
    metrics::describe_counter!("extraction_jobs_failed", "Total extraction jobs that failed");
    metrics::describe_counter!(
        "extraction_transport_retries",
        "Model call attempts that failed with a retryable error"
    );
    metrics::describe_counter!(
        "extraction_confidence_retries",
        "Re-extractions triggered by low overall confidence"
    );
    metrics::describe_counter!(
        "extraction_cache_hits",
        "Result cache hits, labeled by tier"
    );
    metrics::describe_counter!("extraction_cache_misses", "Result cache misses");
    metrics::describe_counter!(
        "extraction_rate_limited_total",
        "Submissions rejected by the rate limiter"
    );
    metrics::describe_histogram!("model_call_seconds", "Latency of upstream model calls");

    // Initialize the upstream model client
    tracing::info!(model = %config.model_name, "Initializing vision model client");
    let backend = Arc::new(VisionModelClient::new(
        config.model_base_url.clone(),
        config.model_api_key.clone(),
        config.model_name.clone(),
        config.model_max_tokens,
        config.model_temperature,
        config.model_timeout(),
    ));

    // Initialize the two-tier result cache
    match &config.redis_url {
        Some(_) => tracing::info!("Initializing result cache with durable Redis tier"),
        None => tracing::info!("No REDIS_URL set, result cache runs in-process only"),
    }
    let cache = ResultCache::new(config.redis_url.as_deref(), config.cache_max_entries);

    // Initialize the orchestrator
    let orchestrator_config = OrchestratorConfig {
        worker_concurrency: config.worker_concurrency,
        transport_policy: RetryPolicy::transport(
            config.transport_max_retries,
            Duration::from_millis(config.transport_base_delay_ms),
        ),
        confidence_policy: RetryPolicy {
            max_attempts: config.confidence_max_attempts,
            base_delay: Duration::from_millis(config.confidence_base_delay_ms),
            backoff_multiplier: config.confidence_backoff_multiplier,
            max_delay: Duration::from_millis(config.confidence_max_delay_ms),
            jitter_fraction: config.confidence_jitter_fraction,
        },
        confidence_threshold: config.confidence_threshold,
        cache_ttl: config.cache_ttl(),
    };
    let orchestrator = ExtractionOrchestrator::new(orchestrator_config, backend, cache);

    // Initialize the admission rate limiter
    let rate_limiter = RateLimiter::new(
        Duration::from_secs(config.rate_limit_window_secs),
        config.rate_limit_max_requests,
        Duration::from_secs(config.rate_limit_block_secs),
        config.rate_limit_max_keys,
    );

    // Create shared application state
    let state = AppState::new(orchestrator, rate_limiter);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/extract", post(routes::extract::submit_extraction))
        .route(
            "/api/v1/extract/{job_id}",
            get(routes::extract::get_job_status),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)); // 10 MB limit

    tracing::info!("Starting attribute-extract on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}
