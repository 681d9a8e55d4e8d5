use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::retry::ErrorClass;

/// A normalized attribute value after validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    Number(f64),
}

/// Validated output for a single schema field, produced once per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeResult {
    /// Whatever the model said, verbatim (stringified).
    pub raw_value: String,
    /// `None` when the value was absent, unparsable, or outside the
    /// controlled vocabulary.
    pub normalized_value: Option<AttributeValue>,
    /// Integer confidence in [0, 100].
    pub confidence: u8,
    pub reasoning: String,
    pub is_valid: bool,
}

/// Token accounting reported by the upstream model service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub total_tokens: u32,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Raw model output before validation.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub content: String,
    pub usage: ModelUsage,
}

/// Final result of an extraction job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub attributes: BTreeMap<String, AttributeResult>,
    pub overall_confidence: u8,
    /// Set when confidence retries were exhausted and this is the best
    /// result seen rather than one that met the threshold.
    #[serde(default)]
    pub low_confidence: bool,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub usage: ModelUsage,
}

/// Terminal error attached to a failed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub class: ErrorClass,
    pub message: String,
}
