use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::models::extraction::{ModelUsage, RawResponse};
use crate::models::retry::ErrorClass;

/// Default hard per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Seam between the pipeline and the upstream vision model service.
///
/// One call, no retry: the transport retry policy lives in the orchestrator
/// so transport and confidence budgets stay independent.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn invoke(&self, prompt: &str, image: &[u8]) -> Result<RawResponse, ModelError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model service rejected credentials (status {0})")]
    Auth(u16),

    #[error("model quota exhausted (status {0})")]
    Quota(u16),

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("model service error (status {status}): {body}")]
    Server { status: u16, body: String },

    #[error("network error calling model service: {0}")]
    Network(#[from] reqwest::Error),

    #[error("model response missing expected structure: {0}")]
    Malformed(String),
}

impl ModelError {
    /// Auth/quota failures propagate immediately; everything else is fair
    /// game for the transport retry policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ModelError::Auth(_) | ModelError::Quota(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ModelError::Auth(_) => ErrorClass::Auth,
            ModelError::Quota(_) => ErrorClass::Quota,
            _ => ErrorClass::Transient,
        }
    }
}

/// Client for an OpenAI-compatible vision chat-completions endpoint.
pub struct VisionModelClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

const SYSTEM_PROMPT: &str = concat!(
    "You are a product attribute extraction assistant. You look at one ",
    "product image and answer with a single JSON object, nothing else."
);

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct UsagePayload {
    #[serde(default)]
    total_tokens: u32,
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl VisionModelClient {
    pub fn new(
        base_url: String,
        api_key: String,
        model: String,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            http: Client::new(),
            base_url,
            api_key,
            model,
            max_tokens,
            temperature,
            timeout,
        }
    }

    fn request_body(&self, prompt: &str, image: &[u8]) -> serde_json::Value {
        let mime = image::guess_format(image)
            .map(|f| f.to_mime_type())
            .unwrap_or("image/jpeg");
        let data_uri = format!(
            "data:{};base64,{}",
            mime,
            base64::engine::general_purpose::STANDARD.encode(image)
        );

        serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": [
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": data_uri}}
                ]}
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"}
        })
    }
}

/// Map an HTTP error status to the failure taxonomy.
fn classify_status(status: StatusCode, body: String) -> ModelError {
    match status.as_u16() {
        401 | 403 => ModelError::Auth(status.as_u16()),
        402 | 429 => ModelError::Quota(status.as_u16()),
        code => ModelError::Server { status: code, body },
    }
}

#[async_trait]
impl ModelBackend for VisionModelClient {
    async fn invoke(&self, prompt: &str, image: &[u8]) -> Result<RawResponse, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt, image))
            .send();

        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(ModelError::Network)?,
            Err(_) => return Err(ModelError::Timeout(self.timeout)),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let chat: ChatResponse = response.json().await.map_err(ModelError::Network)?;
        let usage = chat.usage.unwrap_or_default();
        let content = chat
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ModelError::Malformed("response contained no choices".to_string()))?;

        Ok(RawResponse {
            content,
            usage: ModelUsage {
                total_tokens: usage.total_tokens,
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_and_quota_are_fatal() {
        let auth = classify_status(StatusCode::UNAUTHORIZED, String::new());
        let quota = classify_status(StatusCode::TOO_MANY_REQUESTS, String::new());
        let server = classify_status(StatusCode::INTERNAL_SERVER_ERROR, "boom".into());

        assert!(auth.is_fatal());
        assert!(quota.is_fatal());
        assert!(!server.is_fatal());
        assert_eq!(auth.class(), ErrorClass::Auth);
        assert_eq!(quota.class(), ErrorClass::Quota);
        assert_eq!(server.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = ModelError::Timeout(Duration::from_secs(30));
        assert!(!err.is_fatal());
        assert_eq!(err.class(), ErrorClass::Transient);
    }
}
