//! # conveyor-db
//!
//! PostgreSQL storage layer for the conveyor job manager.
//!
//! This crate provides:
//! - Connection pool management
//! - The `PgJobStore` repository implementing `conveyor_core::JobStore`
//! - Schema management (idempotent initialize, hard reset, uninstall)
//! - Exponential-backoff retry around transient driver errors
//! - A periodic database health prober with state-change callbacks
//!
//! ## Example
//!
//! ```rust,ignore
//! use conveyor_db::{create_pool, Database};
//! use conveyor_core::CreateJobRequest;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/conveyor", "").await?;
//!     db.schema.initialize(false).await?;
//!
//!     let job = db.jobs.insert(&CreateJobRequest::new("email.send")).await?;
//!     println!("Created job {}", job.uid);
//!     Ok(())
//! }
//! ```

pub mod db_retry;
pub mod health;
pub mod pool;
pub mod schema;
pub mod store;

// Re-export core types
pub use conveyor_core::*;

pub use db_retry::{is_retryable, with_db_retry, DbRetryOptions, RetryingStore};
pub use health::{DbHealthMonitor, HealthCallback, HealthCheckConfig};
pub use pool::{create_pool, create_pool_with_config, log_pool_metrics, PoolConfig};
pub use schema::{SchemaManager, TableNames, ATTEMPT_TABLE_SUFFIX, JOB_TABLE_SUFFIX};
pub use store::PgJobStore;

use sqlx::PgPool;

/// Combined database context: pool, job store, and schema manager sharing a
/// single table-name configuration.
#[derive(Clone)]
pub struct Database {
    pub pool: PgPool,
    pub jobs: PgJobStore,
    pub schema: SchemaManager,
}

impl Database {
    /// Wrap an existing pool. The caller keeps ownership of pool lifecycle.
    pub fn new(pool: PgPool, table_prefix: &str) -> Result<Self> {
        let tables = TableNames::new(table_prefix)?;
        Ok(Self {
            jobs: PgJobStore::new(pool.clone(), tables.clone()),
            schema: SchemaManager::new(pool.clone(), tables),
            pool,
        })
    }

    /// Connect with default pool settings and wrap the result.
    pub async fn connect(database_url: &str, table_prefix: &str) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        Self::new(pool, table_prefix)
    }
}
