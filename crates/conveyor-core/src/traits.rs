//! Trait seams between the coordination layer and storage.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    CreateJobRequest, HealthPreviewRow, Job, JobAttempt, ListJobsRequest, QueueStats,
};

/// Durable job storage.
///
/// The worker pool, executor, and manager are written against this trait so
/// they can be exercised end-to-end with an in-memory store in tests. The
/// production implementation is `conveyor_db::PgJobStore`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job row. The store assigns `id` and `uid`.
    async fn insert(&self, request: &CreateJobRequest) -> Result<Job>;

    /// Atomically claim the oldest eligible pending row.
    ///
    /// The claim transitions the row to `running`, stamps `started_at` and
    /// `updated_at`, and increments `attempts` in one statement, so under N
    /// concurrent claimers each eligible row is handed to exactly one.
    async fn claim_next(&self) -> Result<Option<Job>>;

    /// Record the start of a physical attempt. Called after the claim, so
    /// `job.attempts` already carries the 1-based attempt number.
    async fn log_attempt_start(&self, job: &Job) -> Result<i32>;

    /// Transition a job to `completed` and close its attempt row.
    async fn complete(&self, job_id: i32, attempt_log_id: i32, result: &JsonValue) -> Result<Job>;

    /// Close the attempt row with the error, then either requeue the job with
    /// backoff or transition it to `failed` when attempts are exhausted.
    async fn fail_or_requeue(&self, job: &Job, attempt_log_id: i32, error: &Error) -> Result<Job>;

    /// Look up a job by its external identifier.
    async fn find(&self, uid: Uuid) -> Result<Option<Job>>;

    /// List jobs with filtering and paging.
    async fn fetch_all(&self, request: &ListJobsRequest) -> Result<Vec<Job>>;

    /// All attempt rows for a job, ordered by id ascending.
    async fn fetch_attempts(&self, job_id: i32) -> Result<Vec<JobAttempt>>;

    /// Transition rows stuck in `running` beyond the threshold to `expired`.
    /// Returns the number of rows touched.
    async fn mark_expired(&self, max_running_minutes: i64) -> Result<u64>;

    /// Per-status counts and average durations over the recent window.
    async fn health_preview(&self, since_minutes: i64) -> Result<Vec<HealthPreviewRow>>;

    /// Number of rows currently in `pending`.
    async fn pending_count(&self) -> Result<i64>;

    /// Aggregate queue statistics.
    async fn queue_stats(&self) -> Result<QueueStats>;
}
