//! The manager facade: worker pool, handler registry, event bus, lifecycle.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use conveyor_core::defaults::{
    EXPIRE_RUNNING_MINUTES, HEALTH_PREVIEW_MINUTES, JOB_CONCURRENCY, JOB_POLL_INTERVAL_MS,
};
use conveyor_core::{
    CreateJobRequest, DbHealthStatus, Error, HealthPreviewRow, Job, JobAttempt, JobCallback,
    JobEventBus, JobStore, ListJobsRequest, QueueStats, Result, Subscription,
};
use conveyor_db::{Database, DbHealthMonitor, DbRetryOptions, HealthCheckConfig, RetryingStore};
use uuid::Uuid;

use crate::executor::Executor;
use crate::handler::{HandlerRegistry, JobHandler};
use crate::worker::Worker;

/// Manager configuration.
#[derive(Clone, Default)]
pub struct ManagerConfig {
    /// Prefix prepended to both table names; may carry a schema qualifier.
    pub table_prefix: String,
    /// Worker idle wait. `None` = default (1000 ms).
    pub poll_interval: Option<Duration>,
    /// Worker count used by [`JobManager::start_default`]. `None` = default (2).
    pub concurrency: Option<usize>,
    /// Handlers registered at construction, keyed by job type.
    pub handlers: Vec<(String, Arc<dyn JobHandler>)>,
    /// Fallback handler used when no per-type handler matches.
    pub fallback_handler: Option<Arc<dyn JobHandler>>,
    /// Register a process-termination hook that calls `stop` (default true).
    pub graceful_shutdown: Option<bool>,
    /// Collapse duplicate (topic, callback) subscriptions (default true).
    pub dedup_subscriptions: Option<bool>,
    /// Retry transient database errors; `None` disables (the default).
    pub db_retry: Option<DbRetryOptions>,
    /// Periodic health probing; `None` disables (the default).
    pub health_check: Option<HealthCheckConfig>,
    /// Threshold for `cleanup` to expire stuck `running` rows (minutes).
    pub expire_running_minutes: Option<i64>,
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overridable settings from the environment.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `CONVEYOR_TABLE_PREFIX` | `""` | Table name prefix |
    /// | `CONVEYOR_POLL_INTERVAL_MS` | `1000` | Worker idle wait |
    /// | `CONVEYOR_CONCURRENCY` | `2` | Default worker count |
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(prefix) = std::env::var("CONVEYOR_TABLE_PREFIX") {
            config.table_prefix = prefix;
        }
        if let Some(ms) = std::env::var("CONVEYOR_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.poll_interval = Some(Duration::from_millis(ms));
        }
        if let Some(n) = std::env::var("CONVEYOR_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            config.concurrency = Some(n.max(1));
        }
        config
    }

    pub fn table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = Some(workers);
        self
    }

    /// Register a handler for a job type at construction time.
    pub fn handler(mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.push((job_type.into(), handler));
        self
    }

    /// Register the fallback handler at construction time.
    pub fn fallback_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.fallback_handler = Some(handler);
        self
    }

    pub fn graceful_shutdown(mut self, enabled: bool) -> Self {
        self.graceful_shutdown = Some(enabled);
        self
    }

    pub fn dedup_subscriptions(mut self, enabled: bool) -> Self {
        self.dedup_subscriptions = Some(enabled);
        self
    }

    pub fn db_retry(mut self, options: DbRetryOptions) -> Self {
        self.db_retry = Some(options);
        self
    }

    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.health_check = Some(config);
        self
    }

    pub fn expire_running_minutes(mut self, minutes: i64) -> Self {
        self.expire_running_minutes = Some(minutes);
        self
    }

    fn effective_poll_interval(&self) -> Duration {
        self.poll_interval
            .unwrap_or(Duration::from_millis(JOB_POLL_INTERVAL_MS))
    }
}

/// Lookup result carrying the job and, optionally, its attempt history.
#[derive(Debug, Clone)]
pub struct JobDetails {
    pub job: Job,
    pub attempts: Option<Vec<JobAttempt>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopping,
}

/// The facade owning the worker pool, handler registry, event bus, per-job
/// callbacks, DB resilience utilities, and the graceful shutdown signal.
///
/// Schema initialization is lazy: the first operation that touches the
/// tables runs `initialize(false)` exactly once.
pub struct JobManager {
    config: ManagerConfig,
    db: Option<Database>,
    store: Arc<dyn JobStore>,
    bus: Arc<JobEventBus>,
    handlers: Arc<RwLock<HandlerRegistry>>,
    active_job_ids: Arc<Mutex<HashSet<i32>>>,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    state: Mutex<Lifecycle>,
    schema_ready: tokio::sync::Mutex<bool>,
    health: Option<DbHealthMonitor>,
    signal_registered: AtomicBool,
}

impl JobManager {
    /// Create a manager on top of a PostgreSQL pool.
    ///
    /// The pool is shared by all workers; the manager never closes it. The
    /// host closes it after [`stop`](Self::stop).
    pub fn new(pool: PgPool, config: ManagerConfig) -> Result<Arc<Self>> {
        let db = Database::new(pool.clone(), &config.table_prefix)?;

        let base: Arc<dyn JobStore> = Arc::new(db.jobs.clone());
        let store: Arc<dyn JobStore> = match &config.db_retry {
            Some(options) => Arc::new(RetryingStore::new(base, options.clone())),
            None => base,
        };

        let health = config
            .health_check
            .clone()
            .map(|hc| DbHealthMonitor::new(pool, hc));

        Ok(Self::assemble(config, Some(db), store, health))
    }

    /// Create a manager on top of any [`JobStore`] implementation.
    ///
    /// Schema management and database health checks are unavailable in this
    /// mode; everything else behaves identically. Used by embedders with
    /// their own storage and by the test suite.
    pub fn with_store(store: Arc<dyn JobStore>, config: ManagerConfig) -> Arc<Self> {
        let store = match &config.db_retry {
            Some(options) => {
                Arc::new(RetryingStore::new(store, options.clone())) as Arc<dyn JobStore>
            }
            None => store,
        };
        Self::assemble(config, None, store, None)
    }

    fn assemble(
        config: ManagerConfig,
        db: Option<Database>,
        store: Arc<dyn JobStore>,
        health: Option<DbHealthMonitor>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let dedup = config.dedup_subscriptions.unwrap_or(true);

        let mut registry = HandlerRegistry::new();
        for (job_type, handler) in &config.handlers {
            registry.set(job_type.clone(), Some(handler.clone()));
        }
        registry.set_fallback(config.fallback_handler.clone());

        Arc::new(Self {
            config,
            db,
            store,
            bus: JobEventBus::new(dedup),
            handlers: Arc::new(RwLock::new(registry)),
            active_job_ids: Arc::new(Mutex::new(HashSet::new())),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            state: Mutex::new(Lifecycle::Idle),
            schema_ready: tokio::sync::Mutex::new(false),
            health,
            signal_registered: AtomicBool::new(false),
        })
    }

    // ───────────────────────── lifecycle ─────────────────────────

    /// Start processing with the configured (or default) worker count.
    pub async fn start_default(self: &Arc<Self>) -> Result<()> {
        self.start(self.config.concurrency.unwrap_or(JOB_CONCURRENCY))
            .await
    }

    /// Spawn `concurrency` workers and begin claiming jobs.
    pub async fn start(self: &Arc<Self>, concurrency: usize) -> Result<()> {
        if concurrency < 1 {
            return Err(Error::InvalidInput(format!(
                "concurrency must be >= 1, got {concurrency}"
            )));
        }
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                Lifecycle::Stopping => {
                    return Err(Error::IllegalState("manager is shutting down".into()))
                }
                Lifecycle::Running => {
                    return Err(Error::IllegalState("manager is already running".into()))
                }
                Lifecycle::Idle => *state = Lifecycle::Running,
            }
        }

        if let Err(err) = self.ensure_schema().await {
            *self.state.lock().unwrap() = Lifecycle::Idle;
            return Err(err);
        }

        let _ = self.shutdown_tx.send(false);

        let poll_interval = self.config.effective_poll_interval();
        let executor = Executor::new(self.store.clone(), self.bus.clone());
        let mut workers = self.workers.lock().unwrap();
        for id in 0..concurrency {
            let worker = Worker {
                id,
                store: self.store.clone(),
                executor: executor.clone(),
                handlers: self.handlers.clone(),
                active_job_ids: self.active_job_ids.clone(),
                poll_interval,
                shutdown: self.shutdown_tx.subscribe(),
            };
            workers.push(tokio::spawn(worker.run()));
        }
        drop(workers);

        if let Some(health) = &self.health {
            health.start();
        }
        if self.config.graceful_shutdown.unwrap_or(true) {
            self.register_signal_hook();
        }

        info!(
            subsystem = "manager",
            op = "start",
            concurrency,
            poll_interval_ms = poll_interval.as_millis() as u64,
            "Job manager started"
        );
        Ok(())
    }

    /// Signal workers to stop and wait for every in-flight handler.
    ///
    /// In-flight handlers are not interrupted; a deadlocked handler blocks
    /// this call indefinitely. Calling `stop` again after it completes is a
    /// no-op.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                Lifecycle::Running => *state = Lifecycle::Stopping,
                _ => return Ok(()),
            }
        }

        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            if let Err(err) = handle.await {
                error!(
                    subsystem = "manager",
                    op = "stop",
                    error = %err,
                    "Worker task panicked during drain"
                );
            }
        }

        if let Some(health) = &self.health {
            health.stop();
        }

        *self.state.lock().unwrap() = Lifecycle::Idle;
        info!(subsystem = "manager", op = "stop", "Job manager stopped");
        Ok(())
    }

    /// Register the process-termination hook at most once per manager.
    fn register_signal_hook(self: &Arc<Self>) {
        if self.signal_registered.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let terminate = async {
                #[cfg(unix)]
                {
                    use tokio::signal::unix::{signal, SignalKind};
                    match signal(SignalKind::terminate()) {
                        Ok(mut stream) => {
                            stream.recv().await;
                        }
                        Err(_) => std::future::pending::<()>().await,
                    }
                }
                #[cfg(not(unix))]
                std::future::pending::<()>().await
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate => {}
            }
            if let Some(manager) = weak.upgrade() {
                info!(
                    subsystem = "manager",
                    op = "signal",
                    "Termination signal received, draining workers"
                );
                if let Err(err) = manager.stop().await {
                    warn!(subsystem = "manager", error = %err, "Shutdown hook failed");
                }
            }
        });
    }

    async fn ensure_schema(&self) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let mut ready = self.schema_ready.lock().await;
        if !*ready {
            db.schema.initialize(false).await?;
            *ready = true;
        }
        Ok(())
    }

    // ───────────────────────── job surface ─────────────────────────

    /// Create a job, optionally attaching a one-shot completion callback.
    pub async fn create(
        &self,
        request: CreateJobRequest,
        on_done: Option<JobCallback>,
    ) -> Result<Job> {
        request.validate()?;
        self.ensure_schema().await?;
        let job = self.store.insert(&request).await?;
        if let Some(callback) = on_done {
            self.bus.on_done_for(job.uid, callback);
        }
        Ok(job)
    }

    /// Look up a job by uid, optionally including its attempt history.
    pub async fn find(&self, uid: Uuid, with_attempts: bool) -> Result<Option<JobDetails>> {
        self.ensure_schema().await?;
        let Some(job) = self.store.find(uid).await? else {
            return Ok(None);
        };
        let attempts = if with_attempts {
            Some(self.store.fetch_attempts(job.id).await?)
        } else {
            None
        };
        Ok(Some(JobDetails { job, attempts }))
    }

    /// List jobs with filtering and paging.
    pub async fn fetch_all(&self, request: ListJobsRequest) -> Result<Vec<Job>> {
        self.ensure_schema().await?;
        self.store.fetch_all(&request).await
    }

    /// Number of rows currently pending.
    pub async fn pending_count(&self) -> Result<i64> {
        self.ensure_schema().await?;
        self.store.pending_count().await
    }

    /// Aggregate queue statistics.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.ensure_schema().await?;
        self.store.queue_stats().await
    }

    /// Transition rows stuck in `running` beyond the configured threshold to
    /// `expired`. Returns the number of rows touched.
    pub async fn cleanup(&self) -> Result<u64> {
        self.ensure_schema().await?;
        let minutes = self
            .config
            .expire_running_minutes
            .unwrap_or(EXPIRE_RUNNING_MINUTES);
        self.store.mark_expired(minutes).await
    }

    /// Per-status counts and average durations over the recent window.
    pub async fn health_preview(&self, since_minutes: Option<i64>) -> Result<Vec<HealthPreviewRow>> {
        self.ensure_schema().await?;
        self.store
            .health_preview(since_minutes.unwrap_or(HEALTH_PREVIEW_MINUTES))
            .await
    }

    // ───────────────────────── handlers ─────────────────────────

    /// Register (or with `None`, remove) the handler for a job type.
    pub fn set_handler(
        &self,
        job_type: impl Into<String>,
        handler: Option<Arc<dyn JobHandler>>,
    ) -> &Self {
        self.handlers.write().unwrap().set(job_type, handler);
        self
    }

    /// Register the fallback handler used when no per-type handler matches.
    pub fn set_fallback_handler(&self, handler: Option<Arc<dyn JobHandler>>) -> &Self {
        self.handlers.write().unwrap().set_fallback(handler);
        self
    }

    /// Remove every registered handler, including the fallback.
    pub fn reset_handlers(&self) {
        self.handlers.write().unwrap().reset();
    }

    // ───────────────────────── events ─────────────────────────

    /// Subscribe to `done` events for the given job types (`"*"` = all).
    pub fn on_done(&self, job_types: &[&str], callback: JobCallback) -> Subscription {
        self.bus.subscribe_done(job_types, callback)
    }

    /// Subscribe to `attempt` events for the given job types (`"*"` = all).
    pub fn on_attempt(&self, job_types: &[&str], callback: JobCallback) -> Subscription {
        self.bus.subscribe_attempt(job_types, callback)
    }

    /// Watch a single job's completion. The callback fires at most once.
    pub fn on_done_for(&self, uid: Uuid, callback: JobCallback) {
        self.bus.on_done_for(uid, callback);
    }

    /// Watch a single job's attempts until it completes.
    pub fn on_attempt_for(&self, uid: Uuid, callback: JobCallback) {
        self.bus.on_attempt_for(uid, callback);
    }

    // ───────────────────────── schema & health ─────────────────────────

    /// Drop and recreate both tables.
    pub async fn reset_hard(&self) -> Result<()> {
        let db = self.require_db()?;
        db.schema.initialize(true).await?;
        *self.schema_ready.lock().await = true;
        Ok(())
    }

    /// Drop both tables. The next table-touching operation re-initializes.
    pub async fn uninstall(&self) -> Result<()> {
        let db = self.require_db()?;
        db.schema.uninstall().await?;
        *self.schema_ready.lock().await = false;
        Ok(())
    }

    /// Last status observed by the periodic monitor, or `None` when health
    /// checking is disabled or has not run yet.
    pub fn get_db_health(&self) -> Option<DbHealthStatus> {
        self.health.as_ref().and_then(|h| h.last_status())
    }

    /// Probe the database right now and return the observation.
    pub async fn check_db_health(&self) -> Result<DbHealthStatus> {
        if let Some(health) = &self.health {
            return Ok(health.check_now().await);
        }
        let db = self.require_db()?;
        let monitor = DbHealthMonitor::new(db.pool.clone(), HealthCheckConfig::new());
        Ok(monitor.check_now().await)
    }

    fn require_db(&self) -> Result<&Database> {
        self.db
            .as_ref()
            .ok_or_else(|| Error::IllegalState("no database attached to this manager".into()))
    }

    // ───────────────────────── introspection ─────────────────────────

    /// Jobs currently executing in this process.
    pub fn active_job_count(&self) -> usize {
        self.active_job_ids.lock().unwrap().len()
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock().unwrap() == Lifecycle::Running
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        // Best effort: wake any workers still parked on the poll sleep.
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_config_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.table_prefix, "");
        assert_eq!(
            config.effective_poll_interval(),
            Duration::from_millis(1000)
        );
        assert!(config.graceful_shutdown.is_none());
        assert!(config.db_retry.is_none());
        assert!(config.health_check.is_none());
    }

    #[test]
    fn test_manager_config_builder() {
        let config = ManagerConfig::new()
            .table_prefix("app_")
            .poll_interval(Duration::from_millis(50))
            .graceful_shutdown(false)
            .dedup_subscriptions(false)
            .expire_running_minutes(10);

        assert_eq!(config.table_prefix, "app_");
        assert_eq!(config.effective_poll_interval(), Duration::from_millis(50));
        assert_eq!(config.graceful_shutdown, Some(false));
        assert_eq!(config.dedup_subscriptions, Some(false));
        assert_eq!(config.expire_running_minutes, Some(10));
    }

    #[tokio::test]
    async fn test_invalid_table_prefix_rejected_at_construction() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/conveyor")
            .expect("lazy pool");
        let result = JobManager::new(pool, ManagerConfig::new().table_prefix("bad;prefix"));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
