use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::extraction::{ExtractionResult, JobError};
use crate::models::retry::RetryContext;

/// Status of an extraction job.
///
/// `Pending → Processing → {Completed, Failed}`. `Processing` may loop back
/// to itself on a retryable transport failure or a low-confidence condition;
/// no transitions leave a terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// An attribute extraction job. Mutated only by the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionJob {
    pub id: Uuid,
    pub status: JobStatus,
    pub image_hash: String,
    pub schema_id: String,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExtractionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub retry_context: RetryContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtractionJob {
    pub fn new(image_hash: String, schema_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            image_hash,
            schema_id,
            attempt_count: 0,
            confidence: None,
            result: None,
            error: None,
            retry_context: RetryContext::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Dedup key: at most one in-flight job per (image, schema) pair.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.image_hash, self.schema_id)
    }
}
