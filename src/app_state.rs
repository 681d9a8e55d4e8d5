use std::sync::Arc;

use crate::services::{orchestrator::ExtractionOrchestrator, rate_limit::RateLimiter};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ExtractionOrchestrator,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(orchestrator: ExtractionOrchestrator, rate_limiter: RateLimiter) -> Self {
        Self {
            orchestrator,
            rate_limiter: Arc::new(rate_limiter),
        }
    }
}
