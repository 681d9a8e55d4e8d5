use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::models::retry::{ErrorClass, RetryContext};

/// Retry contexts idle for longer than this are garbage-collected.
const CONTEXT_MAX_AGE_SECS: i64 = 3600;

/// Exponential backoff policy with optional jitter.
///
/// Transport retries and confidence retries are two separate values of this
/// type with separate counters; the orchestrator composes them explicitly.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Random extra delay as a fraction of the exponential delay (0.1 = up
    /// to 10%).
    pub jitter_fraction: f64,
}

impl RetryPolicy {
    /// Transport policy: plain doubling, no jitter.
    pub fn transport(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter_fraction: 0.0,
        }
    }

    /// Delay before the retry that follows `attempt` (1-based):
    /// `base * multiplier^(attempt-1) + jitter`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let exponential = self.base_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32 - 1);
        let exponential = exponential.min(self.max_delay.as_millis() as f64);
        let jitter = exponential * self.jitter_fraction * fastrand::f64();
        let total = (exponential + jitter).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(total.max(1.0) as u64)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Outcome of assessing a completed attempt's overall confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Confidence met the threshold; take this result.
    Accept,
    /// Below threshold with budget left: wait and re-extract.
    Retry { delay: Duration },
    /// Budget exhausted: complete with the best result seen, tagged
    /// low-confidence.
    UseBest,
}

/// Decides whether a low-confidence result triggers another attempt.
pub struct ConfidenceRetryCoordinator {
    policy: RetryPolicy,
    threshold: u8,
}

impl ConfidenceRetryCoordinator {
    pub fn new(policy: RetryPolicy, threshold: u8) -> Self {
        Self { policy, threshold }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    pub fn assess(&self, attempt: u32, overall_confidence: u8) -> RetryDecision {
        if overall_confidence >= self.threshold {
            RetryDecision::Accept
        } else if self.policy.is_exhausted(attempt) {
            RetryDecision::UseBest
        } else {
            RetryDecision::Retry {
                delay: self.policy.delay_for_attempt(attempt),
            }
        }
    }
}

/// Per-job attempt ledger, carried onto terminal results for observability
/// and garbage-collected by age for jobs that never get collected.
#[derive(Default)]
pub struct RetryTracker {
    contexts: DashMap<Uuid, RetryContext>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(
        &self,
        job_id: Uuid,
        attempt_number: u32,
        error_class: Option<ErrorClass>,
        delay: Duration,
        retryable: bool,
    ) {
        self.gc();
        self.contexts
            .entry(job_id)
            .or_default()
            .record(attempt_number, error_class, delay.as_millis() as u64, retryable);
    }

    pub fn mark_exhausted(&self, job_id: Uuid) {
        if let Some(mut ctx) = self.contexts.get_mut(&job_id) {
            ctx.is_exhausted = true;
            ctx.next_retry_at = None;
        }
    }

    /// Remove and return the job's context for attaching to its terminal
    /// state.
    pub fn take(&self, job_id: Uuid) -> RetryContext {
        self.contexts
            .remove(&job_id)
            .map(|(_, ctx)| ctx)
            .unwrap_or_default()
    }

    /// Drop contexts whose last activity is past the age threshold.
    fn gc(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(CONTEXT_MAX_AGE_SECS);
        self.contexts.retain(|_, ctx| {
            ctx.last_attempt_at().map_or(true, |at| at > cutoff)
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.contexts.len()
    }
}
