//! Periodic database health probing with state-change callbacks.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::{PgPool, Row};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use conveyor_core::defaults::DB_HEALTH_CHECK_INTERVAL_MS;
use conveyor_core::DbHealthStatus;

/// Callback invoked with the status that triggered a health transition.
pub type HealthCallback = Arc<dyn Fn(&DbHealthStatus) + Send + Sync>;

/// Health monitor configuration.
#[derive(Clone, Default)]
pub struct HealthCheckConfig {
    /// Interval between probes. `None` = default (30s).
    pub interval: Option<Duration>,
    /// Fired once when the database transitions healthy → unhealthy.
    pub on_unhealthy: Option<HealthCallback>,
    /// Fired once when the database transitions unhealthy → healthy.
    pub on_healthy: Option<HealthCallback>,
}

impl HealthCheckConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn on_unhealthy(mut self, callback: HealthCallback) -> Self {
        self.on_unhealthy = Some(callback);
        self
    }

    pub fn on_healthy(mut self, callback: HealthCallback) -> Self {
        self.on_healthy = Some(callback);
        self
    }

    fn effective_interval(&self) -> Duration {
        self.interval
            .unwrap_or(Duration::from_millis(DB_HEALTH_CHECK_INTERVAL_MS))
    }
}

/// Which edge a new observation crossed, relative to the previous one.
///
/// The baseline before any observation is healthy, so a first unhealthy
/// probe fires `WentUnhealthy` while a first healthy probe fires nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    WentUnhealthy,
    WentHealthy,
}

fn transition_kind(previous_healthy: Option<bool>, now_healthy: bool) -> Option<Transition> {
    match (previous_healthy.unwrap_or(true), now_healthy) {
        (true, false) => Some(Transition::WentUnhealthy),
        (false, true) => Some(Transition::WentHealthy),
        _ => None,
    }
}

/// Extract the numeric version token from a `SELECT version()` banner,
/// e.g. `"PostgreSQL 16.3 on x86_64-pc-linux-gnu"` → `"16.3"`.
fn extract_version_token(banner: &str) -> Option<String> {
    let mut words = banner.split_whitespace();
    let product = words.next()?;
    if !product.eq_ignore_ascii_case("postgresql") {
        return None;
    }
    words
        .next()
        .map(|v| v.trim_end_matches(',').to_string())
}

/// Periodic prober issuing `SELECT version(), NOW()` against the pool.
pub struct DbHealthMonitor {
    pool: PgPool,
    config: HealthCheckConfig,
    last: Arc<Mutex<Option<DbHealthStatus>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DbHealthMonitor {
    pub fn new(pool: PgPool, config: HealthCheckConfig) -> Self {
        Self {
            pool,
            config,
            last: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    /// Begin periodic probing. A second call while running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            return;
        }

        let pool = self.pool.clone();
        let config = self.config.clone();
        let last = self.last.clone();
        let interval = self.config.effective_interval();

        info!(
            subsystem = "db",
            component = "health",
            op = "start",
            interval_ms = interval.as_millis() as u64,
            "Database health monitor started"
        );

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let status = probe(&pool).await;
                record(&last, &config, status);
            }
        }));
    }

    /// Stop probing. The last observed status stays readable.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
            info!(
                subsystem = "db",
                component = "health",
                op = "stop",
                "Database health monitor stopped"
            );
        }
    }

    /// Most recent observation, or `None` if never probed.
    pub fn last_status(&self) -> Option<DbHealthStatus> {
        self.last.lock().unwrap().clone()
    }

    /// Probe once right now, record the observation, and return it.
    pub async fn check_now(&self) -> DbHealthStatus {
        let status = probe(&self.pool).await;
        record(&self.last, &self.config, status.clone());
        status
    }
}

impl Drop for DbHealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn probe(pool: &PgPool) -> DbHealthStatus {
    let start = Instant::now();
    match sqlx::query("SELECT version(), NOW()").fetch_one(pool).await {
        Ok(row) => {
            let banner: String = row.get(0);
            DbHealthStatus {
                healthy: true,
                latency_ms: start.elapsed().as_millis() as i64,
                error: None,
                checked_at: Utc::now(),
                server_version: extract_version_token(&banner),
            }
        }
        Err(err) => DbHealthStatus {
            healthy: false,
            latency_ms: start.elapsed().as_millis() as i64,
            error: Some(err.to_string()),
            checked_at: Utc::now(),
            server_version: None,
        },
    }
}

fn record(
    last: &Mutex<Option<DbHealthStatus>>,
    config: &HealthCheckConfig,
    status: DbHealthStatus,
) {
    let transition = {
        let mut last = last.lock().unwrap();
        let previous = last.as_ref().map(|s| s.healthy);
        let transition = transition_kind(previous, status.healthy);
        *last = Some(status.clone());
        transition
    };

    match transition {
        Some(Transition::WentUnhealthy) => {
            warn!(
                subsystem = "db",
                component = "health",
                error = status.error.as_deref().unwrap_or("unknown"),
                "Database became unhealthy"
            );
            if let Some(callback) = &config.on_unhealthy {
                callback(&status);
            }
        }
        Some(Transition::WentHealthy) => {
            info!(
                subsystem = "db",
                component = "health",
                latency_ms = status.latency_ms,
                "Database recovered"
            );
            if let Some(callback) = &config.on_healthy {
                callback(&status);
            }
        }
        None => {
            debug!(
                subsystem = "db",
                component = "health",
                healthy = status.healthy,
                latency_ms = status.latency_ms,
                "Health probe"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status(healthy: bool) -> DbHealthStatus {
        DbHealthStatus {
            healthy,
            latency_ms: 1,
            error: if healthy {
                None
            } else {
                Some("connection refused".to_string())
            },
            checked_at: Utc::now(),
            server_version: None,
        }
    }

    #[test]
    fn test_extract_version_token() {
        assert_eq!(
            extract_version_token("PostgreSQL 16.3 on x86_64-pc-linux-gnu, compiled by gcc"),
            Some("16.3".to_string())
        );
        assert_eq!(
            extract_version_token("PostgreSQL 14.11"),
            Some("14.11".to_string())
        );
        assert_eq!(extract_version_token("MariaDB 10.6"), None);
        assert_eq!(extract_version_token(""), None);
    }

    #[test]
    fn test_transition_baseline_is_healthy() {
        assert_eq!(
            transition_kind(None, false),
            Some(Transition::WentUnhealthy)
        );
        assert_eq!(transition_kind(None, true), None);
    }

    #[test]
    fn test_transition_edges() {
        assert_eq!(
            transition_kind(Some(true), false),
            Some(Transition::WentUnhealthy)
        );
        assert_eq!(
            transition_kind(Some(false), true),
            Some(Transition::WentHealthy)
        );
        assert_eq!(transition_kind(Some(true), true), None);
        assert_eq!(transition_kind(Some(false), false), None);
    }

    #[test]
    fn test_record_fires_callbacks_once_per_transition() {
        let unhealthy_count = Arc::new(AtomicUsize::new(0));
        let healthy_count = Arc::new(AtomicUsize::new(0));
        let u2 = unhealthy_count.clone();
        let h2 = healthy_count.clone();

        let config = HealthCheckConfig::new()
            .on_unhealthy(Arc::new(move |_s| {
                u2.fetch_add(1, Ordering::SeqCst);
            }))
            .on_healthy(Arc::new(move |_s| {
                h2.fetch_add(1, Ordering::SeqCst);
            }));

        let last = Mutex::new(None);

        record(&last, &config, status(false)); // baseline → unhealthy
        record(&last, &config, status(false)); // still unhealthy, no callback
        record(&last, &config, status(true)); // recovered
        record(&last, &config, status(true)); // still healthy, no callback
        record(&last, &config, status(false)); // degraded again

        assert_eq!(unhealthy_count.load(Ordering::SeqCst), 2);
        assert_eq!(healthy_count.load(Ordering::SeqCst), 1);
        assert!(!last.lock().unwrap().as_ref().unwrap().healthy);
    }

    #[test]
    fn test_effective_interval_default() {
        let config = HealthCheckConfig::new();
        assert_eq!(config.effective_interval(), Duration::from_millis(30_000));
        let config = config.interval(Duration::from_secs(5));
        assert_eq!(config.effective_interval(), Duration::from_secs(5));
    }
}
