//! Per-attempt deadline enforcement.

use std::future::Future;
use std::time::Duration;

use serde_json::Value as JsonValue;

use conveyor_core::{Error, Result};

/// Race a handler invocation against a deadline.
///
/// When the timer wins, the handler future is dropped at its current await
/// point and [`Error::Timeout`] is returned. Work the handler has already
/// spawned onto the runtime is **not** terminated; callers that need hard
/// cancellation must observe cancellation themselves. A `deadline_ms` of
/// zero (or less) runs the handler without a deadline.
pub async fn run_with_deadline<F>(future: F, deadline_ms: i32) -> Result<JsonValue>
where
    F: Future<Output = Result<JsonValue>>,
{
    if deadline_ms <= 0 {
        return future.await;
    }
    match tokio::time::timeout(Duration::from_millis(deadline_ms as u64), future).await {
        Ok(result) => result,
        Err(_elapsed) => Err(Error::Timeout),
    }
}
