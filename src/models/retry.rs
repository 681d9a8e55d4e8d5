use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

/// Failure taxonomy for the extraction pipeline.
///
/// `Auth` and `Quota` are fatal and surfaced immediately. `Transient` and
/// `Parse` are retried under the transport budget. `LowConfidence` is not an
/// error at all; it drives the confidence-retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Auth,
    Quota,
    Transient,
    Parse,
    LowConfidence,
}

impl ErrorClass {
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::Transient | ErrorClass::Parse | ErrorClass::LowConfidence
        )
    }
}

/// One recorded attempt, transport or confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub error_class: Option<ErrorClass>,
    pub delay_ms: u64,
    pub retryable: bool,
}

/// Attempt history carried on every terminal result or error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryContext {
    pub attempts: Vec<AttemptRecord>,
    pub total_delay_ms: u64,
    pub is_exhausted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RetryContext {
    pub fn total_attempts(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn record(
        &mut self,
        attempt_number: u32,
        error_class: Option<ErrorClass>,
        delay_ms: u64,
        retryable: bool,
    ) {
        self.attempts.push(AttemptRecord {
            attempt_number,
            timestamp: Utc::now(),
            error_class,
            delay_ms,
            retryable,
        });
        self.total_delay_ms += delay_ms;
        self.next_retry_at = if retryable && delay_ms > 0 {
            Some(Utc::now() + chrono::Duration::milliseconds(delay_ms as i64))
        } else {
            None
        };
    }

    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.attempts.last().map(|a| a.timestamp)
    }
}
