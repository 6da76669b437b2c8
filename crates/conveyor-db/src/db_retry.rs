//! Exponential-backoff retry for transient database errors.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use conveyor_core::defaults::{
    DB_RETRYABLE_SQLSTATES, DB_RETRY_BACKOFF_MULTIPLIER, DB_RETRY_INITIAL_DELAY_MS,
    DB_RETRY_MAX_DELAY_MS, DB_RETRY_MAX_RETRIES,
};
use conveyor_core::{
    CreateJobRequest, Error, HealthPreviewRow, Job, JobAttempt, JobStore, ListJobsRequest,
    QueueStats, Result,
};

/// Retry policy for transient database errors.
#[derive(Debug, Clone)]
pub struct DbRetryOptions {
    /// Maximum retry count after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the retry delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_multiplier: u32,
    /// SQLSTATE codes considered transient; an error whose code or message
    /// carries one of these is retried.
    pub retryable_codes: Vec<String>,
}

impl Default for DbRetryOptions {
    fn default() -> Self {
        Self {
            max_retries: DB_RETRY_MAX_RETRIES,
            initial_delay: Duration::from_millis(DB_RETRY_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DB_RETRY_MAX_DELAY_MS),
            backoff_multiplier: DB_RETRY_BACKOFF_MULTIPLIER,
            retryable_codes: DB_RETRYABLE_SQLSTATES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl DbRetryOptions {
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn retryable_code(mut self, code: impl Into<String>) -> Self {
        self.retryable_codes.push(code.into());
        self
    }
}

/// Whether an error is worth retrying under the given code set.
///
/// Connection-layer failures (I/O, pool acquire timeout) are always
/// transient. Server errors match by SQLSTATE, falling back to a message
/// substring check for drivers that do not surface the code.
pub fn is_retryable(error: &Error, codes: &[String]) -> bool {
    let Error::Database(db_err) = error else {
        return false;
    };
    match db_err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(server_err) => {
            if let Some(code) = server_err.code() {
                codes.iter().any(|c| c.as_str() == code.as_ref())
            } else {
                let message = server_err.to_string();
                codes.iter().any(|c| message.contains(c.as_str()))
            }
        }
        other => {
            let message = other.to_string();
            codes.iter().any(|c| message.contains(c.as_str()))
        }
    }
}

/// Run `op`, retrying transient failures with exponential backoff.
///
/// Non-retryable errors surface immediately; retryable ones are retried up
/// to `options.max_retries` times with the delay doubling (by
/// `backoff_multiplier`) up to `options.max_delay`.
pub async fn with_db_retry<T, F, Fut>(options: &DbRetryOptions, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = options.initial_delay;
    let mut retries = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if retries < options.max_retries && is_retryable(&err, &options.retryable_codes) => {
                retries += 1;
                warn!(
                    subsystem = "db",
                    component = "retry",
                    retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient database error, retrying"
                );
                sleep(delay).await;
                delay = (delay * options.backoff_multiplier).min(options.max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// [`JobStore`] decorator that applies [`with_db_retry`] to every operation.
pub struct RetryingStore {
    inner: std::sync::Arc<dyn JobStore>,
    options: DbRetryOptions,
}

impl RetryingStore {
    pub fn new(inner: std::sync::Arc<dyn JobStore>, options: DbRetryOptions) -> Self {
        Self { inner, options }
    }
}

#[async_trait]
impl JobStore for RetryingStore {
    async fn insert(&self, request: &CreateJobRequest) -> Result<Job> {
        with_db_retry(&self.options, || self.inner.insert(request)).await
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        with_db_retry(&self.options, || self.inner.claim_next()).await
    }

    async fn log_attempt_start(&self, job: &Job) -> Result<i32> {
        with_db_retry(&self.options, || self.inner.log_attempt_start(job)).await
    }

    async fn complete(&self, job_id: i32, attempt_log_id: i32, result: &JsonValue) -> Result<Job> {
        with_db_retry(&self.options, || {
            self.inner.complete(job_id, attempt_log_id, result)
        })
        .await
    }

    async fn fail_or_requeue(&self, job: &Job, attempt_log_id: i32, error: &Error) -> Result<Job> {
        with_db_retry(&self.options, || {
            self.inner.fail_or_requeue(job, attempt_log_id, error)
        })
        .await
    }

    async fn find(&self, uid: Uuid) -> Result<Option<Job>> {
        with_db_retry(&self.options, || self.inner.find(uid)).await
    }

    async fn fetch_all(&self, request: &ListJobsRequest) -> Result<Vec<Job>> {
        with_db_retry(&self.options, || self.inner.fetch_all(request)).await
    }

    async fn fetch_attempts(&self, job_id: i32) -> Result<Vec<JobAttempt>> {
        with_db_retry(&self.options, || self.inner.fetch_attempts(job_id)).await
    }

    async fn mark_expired(&self, max_running_minutes: i64) -> Result<u64> {
        with_db_retry(&self.options, || self.inner.mark_expired(max_running_minutes)).await
    }

    async fn health_preview(&self, since_minutes: i64) -> Result<Vec<HealthPreviewRow>> {
        with_db_retry(&self.options, || self.inner.health_preview(since_minutes)).await
    }

    async fn pending_count(&self) -> Result<i64> {
        with_db_retry(&self.options, || self.inner.pending_count()).await
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        with_db_retry(&self.options, || self.inner.queue_stats()).await
    }
}
