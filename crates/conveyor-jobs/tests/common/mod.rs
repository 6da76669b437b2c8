//! In-memory `JobStore` used to exercise the full worker/executor/manager
//! pipeline without a database. The single mutex makes every operation
//! atomic, which matches the claim protocol's exclusion guarantee.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use conveyor_core::{
    backoff_delay, AttemptStatus, CreateJobRequest, Error, HealthPreviewRow, Job, JobAttempt,
    JobStatus, JobStore, ListJobsRequest, QueueStats, Result,
};

#[derive(Default)]
struct Inner {
    jobs: Vec<Job>,
    attempts: Vec<JobAttempt>,
    next_job_id: i32,
    next_attempt_id: i32,
}

#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    /// While non-zero, `claim_next` fails with a transient error and
    /// decrements. Lets tests drive the worker's claim-error path.
    claim_failures: AtomicU32,
}

impl MemoryJobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inject_claim_failures(&self, count: u32) {
        self.claim_failures.store(count, Ordering::SeqCst);
    }

    /// Pretend a running job's claim happened `minutes` ago, so expiry
    /// sweeps can be tested without waiting.
    pub fn backdate_started_at(&self, uid: Uuid, minutes: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.iter_mut().find(|j| j.uid == uid) {
            job.started_at = Some(Utc::now() - chrono::Duration::minutes(minutes));
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, request: &CreateJobRequest) -> Result<Job> {
        request.validate()?;
        let mut inner = self.inner.lock().unwrap();
        inner.next_job_id += 1;
        let now = Utc::now();
        let job = Job {
            id: inner.next_job_id,
            uid: Uuid::new_v4(),
            job_type: request.job_type.clone(),
            payload: request.payload.clone(),
            status: JobStatus::Pending,
            result: json!({}),
            attempts: 0,
            max_attempts: request.max_attempts,
            max_attempt_duration_ms: request.max_attempt_duration_ms,
            backoff_strategy: request.backoff_strategy,
            created_at: now,
            updated_at: now,
            run_at: request.run_at.unwrap_or(now),
            started_at: None,
            completed_at: None,
        };
        inner.jobs.push(job.clone());
        Ok(job)
    }

    async fn claim_next(&self) -> Result<Option<Job>> {
        let pending = self.claim_failures.load(Ordering::SeqCst);
        if pending > 0
            && self
                .claim_failures
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }

        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let candidate = inner
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending && j.run_at <= now)
            .min_by_key(|j| j.id);
        Ok(candidate.map(|job| {
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.updated_at = now;
            job.attempts += 1;
            job.clone()
        }))
    }

    async fn log_attempt_start(&self, job: &Job) -> Result<i32> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_attempt_id += 1;
        let id = inner.next_attempt_id;
        let attempt = JobAttempt {
            id,
            job_id: job.id,
            attempt_number: job.attempts,
            started_at: Utc::now(),
            completed_at: None,
            status: None,
            error_message: None,
            error_details: None,
        };
        inner.attempts.push(attempt);
        Ok(id)
    }

    async fn complete(&self, job_id: i32, attempt_log_id: i32, result: &JsonValue) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        if let Some(attempt) = inner.attempts.iter_mut().find(|a| a.id == attempt_log_id) {
            attempt.status = Some(AttemptStatus::Success);
            attempt.completed_at = Some(now);
        }

        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| Error::Internal(format!("no such job: {job_id}")))?;
        job.status = JobStatus::Completed;
        job.result = result.clone();
        job.completed_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn fail_or_requeue(&self, job: &Job, attempt_log_id: i32, error: &Error) -> Result<Job> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        if let Some(attempt) = inner.attempts.iter_mut().find(|a| a.id == attempt_log_id) {
            attempt.status = Some(AttemptStatus::Error);
            attempt.completed_at = Some(now);
            attempt.error_message = Some(error.attempt_message());
            attempt.error_details = Some(error.attempt_details());
        }

        let stored = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job.id)
            .ok_or_else(|| Error::Internal(format!("no such job: {}", job.id)))?;
        if job.attempts >= job.max_attempts {
            stored.status = JobStatus::Failed;
            stored.completed_at = Some(now);
        } else {
            let delay = backoff_delay(job.attempts, job.backoff_strategy);
            stored.status = JobStatus::Pending;
            stored.run_at = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        }
        stored.updated_at = now;
        Ok(stored.clone())
    }

    async fn find(&self, uid: Uuid) -> Result<Option<Job>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.jobs.iter().find(|j| j.uid == uid).cloned())
    }

    async fn fetch_all(&self, request: &ListJobsRequest) -> Result<Vec<Job>> {
        let inner = self.inner.lock().unwrap();
        let cutoff = request
            .since_minutes
            .map(|m| Utc::now() - chrono::Duration::minutes(m));
        let mut jobs: Vec<Job> = inner
            .jobs
            .iter()
            .filter(|j| request.status.map_or(true, |s| j.status == s))
            .filter(|j| cutoff.map_or(true, |c| j.created_at >= c))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        if !request.ascending {
            jobs.reverse();
        }
        Ok(jobs
            .into_iter()
            .skip(request.offset.max(0) as usize)
            .take(request.limit.max(0) as usize)
            .collect())
    }

    async fn fetch_attempts(&self, job_id: i32) -> Result<Vec<JobAttempt>> {
        let inner = self.inner.lock().unwrap();
        let mut attempts: Vec<JobAttempt> = inner
            .attempts
            .iter()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.id);
        Ok(attempts)
    }

    async fn mark_expired(&self, max_running_minutes: i64) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::minutes(max_running_minutes);
        let mut affected = 0;
        for job in inner.jobs.iter_mut() {
            if job.status == JobStatus::Running
                && job.started_at.is_some_and(|s| s < cutoff)
            {
                job.status = JobStatus::Expired;
                job.completed_at = Some(Utc::now());
                job.updated_at = Utc::now();
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn health_preview(&self, since_minutes: i64) -> Result<Vec<HealthPreviewRow>> {
        let inner = self.inner.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::minutes(since_minutes);
        let mut rows: Vec<HealthPreviewRow> = Vec::new();
        for job in inner.jobs.iter().filter(|j| j.created_at >= cutoff) {
            let duration = match (job.started_at, job.completed_at) {
                (Some(s), Some(c)) => Some((c - s).num_milliseconds() as f64 / 1000.0),
                _ => None,
            };
            match rows.iter_mut().find(|r| r.status == job.status) {
                Some(row) => {
                    row.count += 1;
                    if let Some(d) = duration {
                        let prev = row.avg_duration_seconds.unwrap_or(0.0);
                        row.avg_duration_seconds =
                            Some(prev + (d - prev) / row.count as f64);
                    }
                }
                None => rows.push(HealthPreviewRow {
                    status: job.status,
                    count: 1,
                    avg_duration_seconds: duration,
                }),
            }
        }
        Ok(rows)
    }

    async fn pending_count(&self) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .count() as i64)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let inner = self.inner.lock().unwrap();
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let recent_terminal = |j: &&Job, status: JobStatus| {
            j.status == status && j.completed_at.is_some_and(|c| c > hour_ago)
        };
        Ok(QueueStats {
            pending: inner
                .jobs
                .iter()
                .filter(|j| j.status == JobStatus::Pending)
                .count() as i64,
            running: inner
                .jobs
                .iter()
                .filter(|j| j.status == JobStatus::Running)
                .count() as i64,
            completed_last_hour: inner
                .jobs
                .iter()
                .filter(|j| recent_terminal(j, JobStatus::Completed))
                .count() as i64,
            failed_last_hour: inner
                .jobs
                .iter()
                .filter(|j| recent_terminal(j, JobStatus::Failed))
                .count() as i64,
            total: inner.jobs.len() as i64,
        })
    }
}
