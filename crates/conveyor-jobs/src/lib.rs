//! # conveyor-jobs
//!
//! Worker pool, executor, and manager facade for the conveyor job manager.
//!
//! This crate provides:
//! - The `JobHandler` trait, closure adapter, and per-type registry
//! - Per-attempt deadline enforcement
//! - The single-job execution pipeline (attempt logging, events, transitions)
//! - The claim-or-sleep worker loop with at-most-one-worker-per-job claims
//! - `JobManager`, the facade owning workers, handlers, events, and shutdown
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use conveyor_core::CreateJobRequest;
//! use conveyor_jobs::{FnHandler, JobManager, ManagerConfig};
//!
//! let pool = conveyor_db::create_pool("postgres://...").await?;
//! let manager = JobManager::new(pool, ManagerConfig::default())?;
//!
//! manager.set_handler(
//!     "email.send",
//!     Some(Arc::new(FnHandler::new(|job| async move {
//!         Ok(serde_json::json!({ "sent": true }))
//!     }))),
//! );
//!
//! manager.start(4).await?;
//! let job = manager.create(CreateJobRequest::new("email.send"), None).await?;
//! // ...
//! manager.stop().await?;
//! ```

pub mod executor;
pub mod handler;
pub mod manager;
pub mod timeout;
mod worker;

// Re-export core types
pub use conveyor_core::*;

pub use executor::Executor;
pub use handler::{FnHandler, HandlerRegistry, JobHandler, NoopHandler};
pub use manager::{JobDetails, JobManager, ManagerConfig};
pub use timeout::run_with_deadline;

/// Default worker poll interval (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = conveyor_core::defaults::JOB_POLL_INTERVAL_MS;

/// Default worker count started by [`JobManager::start_default`].
pub const DEFAULT_CONCURRENCY: usize = conveyor_core::defaults::JOB_CONCURRENCY;
