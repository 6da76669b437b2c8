//! Core job model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Lifecycle status of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Cleanup-only state for rows whose worker likely died mid-execution.
    /// Expired rows are never resurrected by the core.
    Expired,
}

impl JobStatus {
    /// Wire/database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Expired => "expired",
        }
    }

    /// Convert a database value. Unknown strings fall back to `Pending`.
    pub fn from_db(s: &str) -> JobStatus {
        match s {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "expired" => JobStatus::Expired,
            _ => JobStatus::Pending, // fallback
        }
    }

    /// Parse a caller-supplied filter value. Unknown strings are rejected.
    pub fn parse(s: &str) -> Result<JobStatus> {
        match s {
            "pending" | "running" | "completed" | "failed" | "expired" => Ok(Self::from_db(s)),
            other => Err(Error::InvalidInput(format!("unknown job status: {other}"))),
        }
    }

    /// Terminal states are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry spacing strategy applied after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    /// `2^attempts` seconds between attempts.
    Exp,
}

impl BackoffStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffStrategy::None => "none",
            BackoffStrategy::Exp => "exp",
        }
    }

    /// Convert a database value. Unknown strategies fall back to `Exp`
    /// with a warning so a typo'd row still retries sanely.
    pub fn from_db(s: &str) -> BackoffStrategy {
        match s {
            "none" => BackoffStrategy::None,
            "exp" => BackoffStrategy::Exp,
            other => {
                tracing::warn!(
                    strategy = %other,
                    "Unknown backoff strategy, falling back to exp"
                );
                BackoffStrategy::Exp
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exp
    }
}

impl std::fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single physical attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Success,
    Error,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Error => "error",
        }
    }

    pub fn from_db(s: &str) -> Option<AttemptStatus> {
        match s {
            "success" => Some(AttemptStatus::Success),
            "error" => Some(AttemptStatus::Error),
            _ => None,
        }
    }
}

/// A persistent unit of work with retry policy.
///
/// External consumers reference jobs by `uid`; `id` is the server-assigned
/// claim-ordering key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i32,
    pub uid: Uuid,
    pub job_type: String,
    pub payload: JsonValue,
    pub status: JobStatus,
    pub result: JsonValue,
    pub attempts: i32,
    pub max_attempts: i32,
    /// Per-attempt deadline in milliseconds; 0 means no deadline.
    pub max_attempt_duration_ms: i32,
    pub backoff_strategy: BackoffStrategy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the row is eligible for claim.
    pub run_at: DateTime<Utc>,
    /// Claim time of the current attempt; overwritten on each claim.
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A single logged execution of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttempt {
    pub id: i32,
    pub job_id: i32,
    /// 1-based sequential attempt number.
    pub attempt_number: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: Option<AttemptStatus>,
    pub error_message: Option<String>,
    pub error_details: Option<JsonValue>,
}

/// Request to create a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub job_type: String,
    pub payload: JsonValue,
    pub max_attempts: i32,
    pub backoff_strategy: BackoffStrategy,
    pub max_attempt_duration_ms: i32,
    /// Earliest eligible claim time. `None` = now. Past values are accepted
    /// verbatim; they simply make the job immediately eligible.
    pub run_at: Option<DateTime<Utc>>,
}

impl CreateJobRequest {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: json!({}),
            max_attempts: crate::defaults::JOB_MAX_ATTEMPTS,
            backoff_strategy: BackoffStrategy::default(),
            max_attempt_duration_ms: 0,
            run_at: None,
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    pub fn with_max_attempt_duration_ms(mut self, ms: i32) -> Self {
        self.max_attempt_duration_ms = ms;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Validate caller-supplied fields.
    pub fn validate(&self) -> Result<()> {
        if self.job_type.trim().is_empty() {
            return Err(Error::InvalidInput("job type must not be empty".into()));
        }
        if self.max_attempts < 1 {
            return Err(Error::InvalidInput(format!(
                "max_attempts must be >= 1, got {}",
                self.max_attempts
            )));
        }
        if self.max_attempt_duration_ms < 0 {
            return Err(Error::InvalidInput(format!(
                "max_attempt_duration_ms must be >= 0, got {}",
                self.max_attempt_duration_ms
            )));
        }
        Ok(())
    }
}

/// Filter/paging options for listing jobs.
#[derive(Debug, Clone)]
pub struct ListJobsRequest {
    pub status: Option<JobStatus>,
    pub limit: i64,
    pub offset: i64,
    /// Ascending `id` order when true; newest-first otherwise.
    pub ascending: bool,
    /// Only rows created within the last N minutes.
    pub since_minutes: Option<i64>,
}

impl Default for ListJobsRequest {
    fn default() -> Self {
        Self {
            status: None,
            limit: crate::defaults::PAGE_LIMIT,
            offset: crate::defaults::PAGE_OFFSET,
            ascending: false,
            since_minutes: None,
        }
    }
}

/// One row of the health preview aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPreviewRow {
    pub status: JobStatus,
    pub count: i64,
    /// Average `completed_at - started_at` in seconds; `None` when no row in
    /// the group has both timestamps.
    pub avg_duration_seconds: Option<f64>,
}

/// Queue statistics summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed_last_hour: i64,
    pub failed_last_hour: i64,
    pub total: i64,
}

/// Last observed database health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbHealthStatus {
    pub healthy: bool,
    pub latency_ms: i64,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
    /// Version token extracted from `SELECT version()`, e.g. `"16.3"`.
    pub server_version: Option<String>,
}

/// Best-effort structured encoding of a handler result.
///
/// Values that cannot be represented as JSON are replaced by a fixed stub so
/// the job still completes and the row schema stays valid.
pub fn encode_result<T: Serialize>(value: &T) -> JsonValue {
    match serde_json::to_value(value) {
        Ok(v) => v,
        Err(e) => json!({
            "message": "Unable to serialize completed job result",
            "details": e.to_string(),
        }),
    }
}
