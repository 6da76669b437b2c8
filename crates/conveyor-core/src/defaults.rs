//! Centralized default constants for the conveyor system.
//!
//! **This module is the single source of truth** for shared default values.
//! All crates reference these constants instead of defining their own magic
//! numbers.

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default maximum attempts per job.
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// Default worker poll interval when the queue is empty (milliseconds).
pub const JOB_POLL_INTERVAL_MS: u64 = 1000;

/// Default number of concurrent workers started by the manager.
pub const JOB_CONCURRENCY: usize = 2;

/// Claim-time errors are logged individually up to this count, then muted
/// until a claim succeeds again.
pub const CLAIM_ERROR_LOG_LIMIT: u32 = 5;

/// Default threshold after which a `running` row is considered orphaned and
/// transitioned to `expired` by `cleanup`.
pub const EXPIRE_RUNNING_MINUTES: i64 = 60;

// =============================================================================
// DATABASE RESILIENCE
// =============================================================================

/// Default retry count for transient database errors.
pub const DB_RETRY_MAX_RETRIES: u32 = 3;

/// Default initial delay before the first database retry (milliseconds).
pub const DB_RETRY_INITIAL_DELAY_MS: u64 = 100;

/// Default ceiling for the database retry delay (milliseconds).
pub const DB_RETRY_MAX_DELAY_MS: u64 = 5000;

/// Default multiplier applied to the retry delay after each attempt.
pub const DB_RETRY_BACKOFF_MULTIPLIER: u32 = 2;

/// Default interval between database health probes (milliseconds).
pub const DB_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;

/// PostgreSQL connection-class SQLSTATEs considered transient.
pub const DB_RETRYABLE_SQLSTATES: [&str; 4] = ["08000", "08003", "08006", "57P03"];

// =============================================================================
// PAGINATION
// =============================================================================

/// Default page size for job listings.
pub const PAGE_LIMIT: i64 = 50;

/// Default page offset.
pub const PAGE_OFFSET: i64 = 0;

/// Default window for the health preview aggregation (minutes).
pub const HEALTH_PREVIEW_MINUTES: i64 = 60;
