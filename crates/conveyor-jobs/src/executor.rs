//! Single-job execution pipeline.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use conveyor_core::{Job, JobEventBus, JobStatus, JobStore};

use crate::handler::JobHandler;
use crate::timeout::run_with_deadline;

/// Drives one claimed job through its attempt: attempt logging, event
/// publication, handler invocation under the optional deadline, and the
/// transactional success/failure transition.
///
/// Execution never propagates errors to the worker loop; store failures on
/// the completion path are logged and swallowed so the loop keeps claiming.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn JobStore>,
    bus: Arc<JobEventBus>,
}

impl Executor {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<JobEventBus>) -> Self {
        Self { store, bus }
    }

    pub async fn execute(&self, job: Job, handler: Arc<dyn JobHandler>) {
        let start = Instant::now();

        let attempt_log_id = match self.store.log_attempt_start(&job).await {
            Ok(id) => id,
            Err(err) => {
                error!(
                    subsystem = "worker",
                    component = "executor",
                    job_id = job.id,
                    job_uid = %job.uid,
                    error = %err,
                    "Failed to log attempt start; abandoning execution"
                );
                return;
            }
        };

        // Start-of-attempt event with the running view, so `on_attempt`
        // consumers observe both edges of every attempt.
        self.bus.publish_attempt(&job);

        let outcome = if job.max_attempt_duration_ms > 0 {
            run_with_deadline(handler.execute(&job), job.max_attempt_duration_ms).await
        } else {
            handler.execute(&job).await
        };

        match outcome {
            Ok(result) => {
                let updated = match self.store.complete(job.id, attempt_log_id, &result).await {
                    Ok(updated) => updated,
                    Err(err) => {
                        error!(
                            subsystem = "worker",
                            component = "executor",
                            job_id = job.id,
                            job_uid = %job.uid,
                            error = %err,
                            "Failed to mark job as completed"
                        );
                        return;
                    }
                };
                info!(
                    subsystem = "worker",
                    component = "executor",
                    job_id = updated.id,
                    job_uid = %updated.uid,
                    job_type = %updated.job_type,
                    attempt = updated.attempts,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job completed"
                );
                self.bus.publish_attempt(&updated);
                self.bus.publish_done(&updated);
            }
            Err(err) => {
                let updated = match self
                    .store
                    .fail_or_requeue(&job, attempt_log_id, &err)
                    .await
                {
                    Ok(updated) => updated,
                    Err(store_err) => {
                        error!(
                            subsystem = "worker",
                            component = "executor",
                            job_id = job.id,
                            job_uid = %job.uid,
                            error = %store_err,
                            "Failed to record job failure"
                        );
                        return;
                    }
                };
                warn!(
                    subsystem = "worker",
                    component = "executor",
                    job_id = updated.id,
                    job_uid = %updated.uid,
                    job_type = %updated.job_type,
                    attempt = job.attempts,
                    error = %err,
                    duration_ms = start.elapsed().as_millis() as u64,
                    requeued = (updated.status == JobStatus::Pending),
                    "Job attempt failed"
                );
                self.bus.publish_attempt(&updated);
                if updated.status == JobStatus::Failed {
                    self.bus.publish_done(&updated);
                }
            }
        }
    }
}
