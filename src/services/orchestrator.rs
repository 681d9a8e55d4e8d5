use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::extraction::{ExtractionResult, JobError, ModelUsage};
use crate::models::job::{ExtractionJob, JobStatus};
use crate::models::retry::ErrorClass;
use crate::models::schema::CategorySchema;
use crate::services::cache::{cache_key, hash_image, ResultCache};
use crate::services::model::{ModelBackend, ModelError};
use crate::services::prompt::SchemaPromptBuilder;
use crate::services::retry::{
    ConfidenceRetryCoordinator, RetryDecision, RetryPolicy, RetryTracker,
};
use crate::services::validation::{self, ValidatedResponse};

/// Tunables for the end-to-end pipeline. Transport and confidence retries
/// are deliberately independent policies.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Cross-job concurrency bound for outstanding model calls.
    pub worker_concurrency: usize,
    pub transport_policy: RetryPolicy,
    pub confidence_policy: RetryPolicy,
    pub confidence_threshold: u8,
    pub cache_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 3,
            transport_policy: RetryPolicy::transport(3, Duration::from_secs(1)),
            confidence_policy: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
                backoff_multiplier: 2.0,
                max_delay: Duration::from_secs(30),
                jitter_fraction: 0.1,
            },
            confidence_threshold: 70,
            cache_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("image payload is empty")]
    EmptyImage,

    #[error("schema failed structural validation: {0}")]
    InvalidSchema(String),
}

/// Terminal failure of one extraction attempt (transport budget included).
enum AttemptFailure {
    Fatal(ModelError),
    Exhausted { last_class: ErrorClass, message: String },
}

/// Composes the whole pipeline: submissions become jobs, jobs run as
/// bounded async tasks, and the orchestrator is the only writer of job
/// state. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ExtractionOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn ModelBackend>,
    prompts: SchemaPromptBuilder,
    cache: ResultCache,
    tracker: RetryTracker,
    coordinator: ConfidenceRetryCoordinator,
    transport_policy: RetryPolicy,
    jobs: DashMap<Uuid, ExtractionJob>,
    inflight: DashMap<String, Uuid>,
    workers: Semaphore,
    cache_ttl: Duration,
}

impl ExtractionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        backend: Arc<dyn ModelBackend>,
        cache: ResultCache,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                prompts: SchemaPromptBuilder::new(),
                cache,
                tracker: RetryTracker::new(),
                coordinator: ConfidenceRetryCoordinator::new(
                    config.confidence_policy.clone(),
                    config.confidence_threshold,
                ),
                transport_policy: config.transport_policy,
                jobs: DashMap::new(),
                inflight: DashMap::new(),
                workers: Semaphore::new(config.worker_concurrency.max(1)),
                cache_ttl: config.cache_ttl,
            }),
        }
    }

    /// Submit an image + schema for extraction. Returns the job id to poll.
    ///
    /// Deduplicates: a second submission for the same (image, schema) pair
    /// while the first is still in flight returns the existing job.
    pub fn submit(
        &self,
        image: Vec<u8>,
        schema: CategorySchema,
    ) -> Result<Uuid, SubmitError> {
        if image.is_empty() {
            return Err(SubmitError::EmptyImage);
        }
        garde::Validate::validate(&schema)
            .map_err(|report| SubmitError::InvalidSchema(report.to_string()))?;

        let image_hash = hash_image(&image);
        let dedup_key = format!("{}:{}", image_hash, schema.id);

        if let Some(existing) = self.inner.inflight.get(&dedup_key) {
            let existing_id = *existing;
            drop(existing);
            if let Some(job) = self.inner.jobs.get(&existing_id) {
                if !job.status.is_terminal() {
                    info!(job_id = %existing_id, "Deduplicated submission onto in-flight job");
                    return Ok(existing_id);
                }
            }
            self.inner.inflight.remove(&dedup_key);
        }

        let job = ExtractionJob::new(image_hash, schema.id.clone());
        let job_id = job.id;
        self.inner.inflight.insert(dedup_key, job_id);
        self.inner.jobs.insert(job_id, job);
        metrics::counter!("extraction_jobs_submitted").increment(1);

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.process(job_id, image, schema).await;
        });

        Ok(job_id)
    }

    /// Snapshot of a job for status polling.
    pub fn get_status(&self, job_id: Uuid) -> Option<ExtractionJob> {
        self.inner.jobs.get(&job_id).map(|job| job.clone())
    }

    /// Free permits in the worker pool, for health reporting.
    pub fn available_workers(&self) -> usize {
        self.inner.workers.available_permits()
    }

    pub fn cache(&self) -> &ResultCache {
        &self.inner.cache
    }

    async fn process(&self, job_id: Uuid, image: Vec<u8>, schema: CategorySchema) {
        self.update_job(job_id, |job| job.status = JobStatus::Processing);

        let image_hash = hash_image(&image);
        let key = cache_key(&image_hash, &schema);

        if let Some(mut cached) = self.inner.cache.get(&key).await {
            cached.from_cache = true;
            info!(job_id = %job_id, confidence = cached.overall_confidence, "Cache hit, skipping model call");
            self.complete(job_id, cached);
            return;
        }

        let prompt = self.inner.prompts.build_prompt(&schema);
        let threshold = self.inner.coordinator.threshold();
        let mut best: Option<ExtractionResult> = None;
        let mut usage_total = ModelUsage::default();

        for attempt in 1..=self.inner.coordinator.max_attempts() {
            // Worker slot held only for the duration of the attempt; backoff
            // waits below run with the permit released.
            let permit = match self.inner.workers.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            self.update_job(job_id, |job| {
                job.status = JobStatus::Processing;
                job.attempt_count = attempt;
            });

            let outcome = self.run_attempt(job_id, &prompt, &image, &schema).await;
            drop(permit);

            let (validated, usage) = match outcome {
                Ok(ok) => ok,
                Err(AttemptFailure::Fatal(e)) => {
                    self.fail(job_id, e.class(), e.to_string());
                    return;
                }
                Err(AttemptFailure::Exhausted { last_class, message }) => {
                    self.inner.tracker.mark_exhausted(job_id);
                    match best.take() {
                        // An earlier attempt produced a usable result:
                        // prefer completing with it over failing.
                        Some(mut usable) => {
                            usable.low_confidence = true;
                            usable.usage = usage_total;
                            self.complete(job_id, usable);
                        }
                        None => self.fail(job_id, last_class, message),
                    }
                    return;
                }
            };

            usage_total = add_usage(usage_total, usage);
            let overall = validated.overall_confidence;
            self.update_job(job_id, |job| job.confidence = Some(overall));

            let result = build_result(validated, overall < threshold, usage_total);
            let improved = best
                .as_ref()
                .map_or(true, |b| overall > b.overall_confidence);
            if improved {
                self.inner.cache.put(&key, &result, self.inner.cache_ttl).await;
                best = Some(result.clone());
            }

            match self.inner.coordinator.assess(attempt, overall) {
                RetryDecision::Accept => {
                    let mut accepted = result;
                    accepted.usage = usage_total;
                    self.complete(job_id, accepted);
                    return;
                }
                RetryDecision::UseBest => {
                    self.inner.tracker.mark_exhausted(job_id);
                    // best is always Some here: the current result was a
                    // candidate on the first attempt at the latest.
                    let mut final_result = best.take().unwrap_or(result);
                    final_result.low_confidence = true;
                    final_result.usage = usage_total;
                    info!(
                        job_id = %job_id,
                        confidence = final_result.overall_confidence,
                        "Confidence retries exhausted, completing with best result"
                    );
                    self.complete(job_id, final_result);
                    return;
                }
                RetryDecision::Retry { delay } => {
                    self.inner.tracker.record_attempt(
                        job_id,
                        attempt,
                        Some(ErrorClass::LowConfidence),
                        delay,
                        true,
                    );
                    metrics::counter!("extraction_confidence_retries").increment(1);
                    info!(
                        job_id = %job_id,
                        attempt = attempt,
                        confidence = overall,
                        threshold = threshold,
                        delay_ms = delay.as_millis() as u64,
                        "Low-confidence result, scheduling re-extraction"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One extraction attempt: model call under the transport retry budget,
    /// then validation. A parse failure of the model body counts as a
    /// retryable failure under the same budget.
    async fn run_attempt(
        &self,
        job_id: Uuid,
        prompt: &str,
        image: &[u8],
        schema: &CategorySchema,
    ) -> Result<(ValidatedResponse, ModelUsage), AttemptFailure> {
        let mut last_class = ErrorClass::Transient;
        let mut last_message = String::new();

        for attempt in 1..=self.inner.transport_policy.max_attempts {
            let start = std::time::Instant::now();
            let invoked = self.inner.backend.invoke(prompt, image).await;
            metrics::histogram!("model_call_seconds").record(start.elapsed().as_secs_f64());

            match invoked {
                Ok(raw) => match validation::validate(&raw.content, schema) {
                    Ok(validated) => return Ok((validated, raw.usage)),
                    Err(parse) => {
                        last_class = ErrorClass::Parse;
                        last_message = parse.to_string();
                        warn!(job_id = %job_id, attempt = attempt, error = %parse, "Model output failed validation parse");
                    }
                },
                Err(e) if e.is_fatal() => {
                    self.inner.tracker.record_attempt(
                        job_id,
                        attempt,
                        Some(e.class()),
                        Duration::ZERO,
                        false,
                    );
                    warn!(job_id = %job_id, error = %e, "Fatal model error, not retrying");
                    return Err(AttemptFailure::Fatal(e));
                }
                Err(e) => {
                    last_class = ErrorClass::Transient;
                    last_message = e.to_string();
                    warn!(job_id = %job_id, attempt = attempt, error = %e, "Retryable model error");
                }
            }

            let will_retry = !self.inner.transport_policy.is_exhausted(attempt);
            let delay = if will_retry {
                self.inner.transport_policy.delay_for_attempt(attempt)
            } else {
                Duration::ZERO
            };
            self.inner
                .tracker
                .record_attempt(job_id, attempt, Some(last_class), delay, will_retry);
            metrics::counter!("extraction_transport_retries").increment(1);

            if will_retry {
                tokio::time::sleep(delay).await;
            }
        }

        Err(AttemptFailure::Exhausted {
            last_class,
            message: format!(
                "model call failed after {} attempts: {}",
                self.inner.transport_policy.max_attempts, last_message
            ),
        })
    }

    fn complete(&self, job_id: Uuid, result: ExtractionResult) {
        let retry_context = self.inner.tracker.take(job_id);
        self.update_job(job_id, |job| {
            job.status = JobStatus::Completed;
            job.confidence = Some(result.overall_confidence);
            job.result = Some(result);
            job.error = None;
            job.retry_context = retry_context;
        });
        self.clear_inflight(job_id);
        metrics::counter!("extraction_jobs_completed").increment(1);
        info!(job_id = %job_id, "Extraction job completed");
    }

    fn fail(&self, job_id: Uuid, class: ErrorClass, message: String) {
        let retry_context = self.inner.tracker.take(job_id);
        warn!(job_id = %job_id, class = %class, error = %message, "Extraction job failed");
        self.update_job(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(JobError { class, message });
            job.retry_context = retry_context;
        });
        self.clear_inflight(job_id);
        metrics::counter!("extraction_jobs_failed").increment(1);
    }

    fn update_job(&self, job_id: Uuid, mutate: impl FnOnce(&mut ExtractionJob)) {
        if let Some(mut job) = self.inner.jobs.get_mut(&job_id) {
            // Terminal states absorb: nothing mutates a finished job.
            if job.status.is_terminal() {
                return;
            }
            mutate(&mut job);
            job.updated_at = chrono::Utc::now();
        }
    }

    fn clear_inflight(&self, job_id: Uuid) {
        let key = self.inner.jobs.get(&job_id).map(|job| job.dedup_key());
        if let Some(key) = key {
            self.inner.inflight.remove(&key);
        }
    }
}

fn build_result(
    validated: ValidatedResponse,
    low_confidence: bool,
    usage: ModelUsage,
) -> ExtractionResult {
    ExtractionResult {
        attributes: validated.attributes,
        overall_confidence: validated.overall_confidence,
        low_confidence,
        from_cache: false,
        usage,
    }
}

fn add_usage(a: ModelUsage, b: ModelUsage) -> ModelUsage {
    ModelUsage {
        total_tokens: a.total_tokens + b.total_tokens,
        prompt_tokens: a.prompt_tokens + b.prompt_tokens,
        completion_tokens: a.completion_tokens + b.completion_tokens,
    }
}
