//! The claim-or-sleep worker loop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info};

use conveyor_core::defaults::CLAIM_ERROR_LOG_LIMIT;
use conveyor_core::JobStore;

use crate::executor::Executor;
use crate::handler::HandlerRegistry;

/// A single long-running worker task.
///
/// Repeatedly claims the next eligible job and hands it to the executor,
/// sleeping `poll_interval` when the queue is empty. Claim-time errors are
/// logged up to [`CLAIM_ERROR_LOG_LIMIT`] occurrences and then muted until a
/// claim succeeds again; the loop itself never propagates errors out.
pub(crate) struct Worker {
    pub id: usize,
    pub store: Arc<dyn JobStore>,
    pub executor: Executor,
    pub handlers: Arc<RwLock<HandlerRegistry>>,
    pub active_job_ids: Arc<Mutex<HashSet<i32>>>,
    pub poll_interval: Duration,
    pub shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub async fn run(mut self) {
        info!(
            subsystem = "worker",
            worker_id = self.id,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Worker started"
        );

        let mut claim_errors = 0u32;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.store.claim_next().await {
                Ok(Some(job)) => {
                    let handler = self.handlers.read().unwrap().resolve(&job.job_type);
                    let job_id = job.id;
                    debug!(
                        subsystem = "worker",
                        worker_id = self.id,
                        job_id,
                        job_uid = %job.uid,
                        job_type = %job.job_type,
                        attempt = job.attempts,
                        "Claimed job"
                    );
                    self.active_job_ids.lock().unwrap().insert(job_id);
                    self.executor.execute(job, handler).await;
                    self.active_job_ids.lock().unwrap().remove(&job_id);
                    claim_errors = 0;
                }
                Ok(None) => {
                    if self.idle_wait().await.is_break() {
                        break;
                    }
                }
                Err(err) => {
                    claim_errors += 1;
                    if claim_errors < CLAIM_ERROR_LOG_LIMIT {
                        error!(
                            subsystem = "worker",
                            worker_id = self.id,
                            error = %err,
                            "Failed to claim job"
                        );
                    } else if claim_errors == CLAIM_ERROR_LOG_LIMIT {
                        error!(
                            subsystem = "worker",
                            worker_id = self.id,
                            error = %err,
                            "Failed to claim job; muting further claim errors"
                        );
                    }
                    if self.idle_wait().await.is_break() {
                        break;
                    }
                }
            }
        }

        info!(subsystem = "worker", worker_id = self.id, "Worker stopped");
    }

    /// Sleep one poll interval, waking early on the shutdown signal.
    async fn idle_wait(&mut self) -> std::ops::ControlFlow<()> {
        tokio::select! {
            changed = self.shutdown.changed() => {
                // A closed channel means the manager is gone; stop as well.
                if changed.is_err() || *self.shutdown.borrow() {
                    return std::ops::ControlFlow::Break(());
                }
                std::ops::ControlFlow::Continue(())
            }
            _ = sleep(self.poll_interval) => std::ops::ControlFlow::Continue(()),
        }
    }
}
