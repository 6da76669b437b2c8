//! Job handlers and the per-type handler registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use conveyor_core::{encode_result, Job, Result};

/// User-supplied job execution logic.
///
/// A handler receives a snapshot of the claimed job (status `running`,
/// `attempts` already incremented) and returns the result value stored on
/// the row, or an error that triggers the retry-or-fail transition.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<JsonValue>;
}

/// Handler used when no per-type handler or fallback matches.
///
/// Completes the job with `{"noop": true}` so the pipeline records a normal
/// completion without user code.
pub struct NoopHandler;

#[async_trait]
impl JobHandler for NoopHandler {
    async fn execute(&self, _job: &Job) -> Result<JsonValue> {
        Ok(json!({ "noop": true }))
    }
}

/// Adapter turning an async closure into a [`JobHandler`].
///
/// The closure may return any `Serialize` value; it is converted to JSON via
/// [`encode_result`] before the store binds it, so a value that cannot be
/// represented (a NaN float, a map with non-string keys) is replaced by the
/// fixed stub and the job still completes.
///
/// ```rust,ignore
/// let handler = FnHandler::new(|job: Job| async move {
///     Ok(serde_json::json!({ "echoed": job.payload }))
/// });
/// ```
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut, T> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send,
    T: Serialize,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut, T> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send,
    T: Serialize,
{
    async fn execute(&self, job: &Job) -> Result<JsonValue> {
        let value = (self.f)(job.clone()).await?;
        Ok(encode_result(&value))
    }
}

fn noop_handler() -> Arc<dyn JobHandler> {
    static NOOP: OnceLock<Arc<dyn JobHandler>> = OnceLock::new();
    NOOP.get_or_init(|| Arc::new(NoopHandler)).clone()
}

/// Mutable mapping from job type to handler, with an optional fallback.
#[derive(Default)]
pub struct HandlerRegistry {
    by_type: HashMap<String, Arc<dyn JobHandler>>,
    fallback: Option<Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or with `None`, remove) the handler for a job type.
    pub fn set(&mut self, job_type: impl Into<String>, handler: Option<Arc<dyn JobHandler>>) {
        let job_type = job_type.into();
        match handler {
            Some(handler) => {
                self.by_type.insert(job_type, handler);
            }
            None => {
                self.by_type.remove(&job_type);
            }
        }
    }

    /// Register (or remove) the fallback used when no per-type handler matches.
    pub fn set_fallback(&mut self, handler: Option<Arc<dyn JobHandler>>) {
        self.fallback = handler;
    }

    /// Remove every handler, including the fallback.
    pub fn reset(&mut self) {
        self.by_type.clear();
        self.fallback = None;
    }

    /// Resolution order: per-type handler, fallback, noop.
    pub fn resolve(&self, job_type: &str) -> Arc<dyn JobHandler> {
        if let Some(handler) = self.by_type.get(job_type) {
            return handler.clone();
        }
        if let Some(fallback) = &self.fallback {
            return fallback.clone();
        }
        noop_handler()
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}
