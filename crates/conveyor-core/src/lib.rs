//! # conveyor-core
//!
//! Core types, traits, and abstractions for the conveyor job manager.
//!
//! This crate provides the foundational data structures and trait definitions
//! that the other conveyor crates depend on: the job and attempt models, the
//! error enum, the `JobStore` storage seam, the retry backoff policy, and the
//! in-process event bus.

pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod retry;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{EventKind, JobCallback, JobEventBus, Subscription, WILDCARD_TOPIC};
pub use models::{
    encode_result, AttemptStatus, BackoffStrategy, CreateJobRequest, DbHealthStatus,
    HealthPreviewRow, Job, JobAttempt, JobStatus, ListJobsRequest, QueueStats,
};
pub use retry::backoff_delay;
pub use traits::JobStore;
