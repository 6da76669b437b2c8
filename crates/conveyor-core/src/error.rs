//! Error types for conveyor.

use thiserror::Error;

/// Result type alias using conveyor's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for conveyor operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Caller violated a precondition (empty type, out-of-range option)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted in the current lifecycle state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Handler exceeded its per-attempt deadline
    #[error("Execution timed out")]
    Timeout,

    /// Job processing error
    #[error("Job error: {0}")]
    Job(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// The message recorded on the attempt row for this error.
    pub fn attempt_message(&self) -> String {
        self.to_string()
    }

    /// Structured details recorded on the attempt row, shaped as
    /// `{"stack": "..."}` so downstream consumers always find the same key.
    pub fn attempt_details(&self) -> serde_json::Value {
        serde_json::json!({ "stack": format!("{:?}", self) })
    }
}
