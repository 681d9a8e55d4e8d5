use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::extraction::{ExtractionResult, JobError};
use crate::models::job::JobStatus;
use crate::models::retry::RetryContext;
use crate::models::schema::CategorySchema;
use crate::services::orchestrator::SubmitError;

/// Response after submitting an image for extraction.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

/// Response for polling job status.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExtractionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub retry_context: RetryContext,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ApiError {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            error: message.into(),
            retry_after_ms: None,
        })
    }
}

/// Rate-limit key: forwarded client address when behind a proxy, else a
/// shared bucket.
fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// POST /api/v1/extract — multipart upload: an `image` part and a `schema`
/// JSON part. Admission-checked, then handed to the orchestrator.
pub async fn submit_extraction(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitResponse>), (StatusCode, Json<ApiError>)> {
    if let Err(limited) = state.rate_limiter.check(&client_key(&headers)) {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(ApiError {
                error: "rate limit exceeded".to_string(),
                retry_after_ms: Some(limited.retry_after_ms),
            }),
        ));
    }

    let mut image_data: Option<Vec<u8>> = None;
    let mut schema: Option<CategorySchema> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| (StatusCode::BAD_REQUEST, ApiError::new("malformed multipart body")))?
    {
        match field.name() {
            Some("image") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|_| (StatusCode::BAD_REQUEST, ApiError::new("unreadable image part")))?;
                image::guess_format(&data).map_err(|_| {
                    (
                        StatusCode::UNSUPPORTED_MEDIA_TYPE,
                        ApiError::new("image part is not a supported image format"),
                    )
                })?;
                image_data = Some(data.to_vec());
            }
            Some("schema") => {
                let text = field
                    .text()
                    .await
                    .map_err(|_| (StatusCode::BAD_REQUEST, ApiError::new("unreadable schema part")))?;
                let parsed: CategorySchema = serde_json::from_str(&text).map_err(|e| {
                    (
                        StatusCode::BAD_REQUEST,
                        ApiError::new(format!("schema is not valid JSON: {e}")),
                    )
                })?;
                schema = Some(parsed);
            }
            _ => {}
        }
    }

    let image_data =
        image_data.ok_or((StatusCode::BAD_REQUEST, ApiError::new("missing image part")))?;
    let schema = schema.ok_or((StatusCode::BAD_REQUEST, ApiError::new("missing schema part")))?;

    let job_id = state
        .orchestrator
        .submit(image_data, schema)
        .map_err(|e| match e {
            SubmitError::EmptyImage => (StatusCode::BAD_REQUEST, ApiError::new(e.to_string())),
            SubmitError::InvalidSchema(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, ApiError::new(e.to_string()))
            }
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobStatus::Pending,
            message: "Image submitted for attribute extraction".to_string(),
        }),
    ))
}

/// GET /api/v1/extract/{job_id} — poll extraction job status.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, (StatusCode, Json<ApiError>)> {
    let job = state
        .orchestrator
        .get_status(job_id)
        .ok_or((StatusCode::NOT_FOUND, ApiError::new("unknown job id")))?;

    Ok(Json(JobStatusResponse {
        job_id: job.id,
        status: job.status,
        attempt_count: job.attempt_count,
        confidence: job.confidence,
        result: job.result,
        error: job.error,
        retry_context: job.retry_context,
    }))
}
