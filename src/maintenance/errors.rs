//! Maintenance error types.

use thiserror::Error;

use crate::inference::errors::InferenceError;

/// Errors raised by background maintenance.
///
/// Per-item failures never reach a request; the scheduler logs and drops them.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    /// Note or index storage failed.
    #[error("store error: {reason}")]
    Store { reason: String },

    /// The summarization model call failed.
    #[error("summarization failed: {reason}")]
    Summarization { reason: String },

    /// Term extraction output was not a JSON array of strings.
    #[error("malformed term output: {raw}")]
    MalformedTerms { raw: String },

    /// A tick interval of zero was requested.
    #[error("maintenance interval must be > 0")]
    InvalidInterval,

    /// The periodic loops are already running.
    #[error("maintenance loops are already running")]
    AlreadyRunning,

    /// `start` was called outside a tokio runtime.
    #[error("tokio runtime is required to start maintenance loops")]
    RuntimeUnavailable,
}

impl From<rusqlite::Error> for MaintenanceError {
    fn from(e: rusqlite::Error) -> Self {
        MaintenanceError::Store {
            reason: e.to_string(),
        }
    }
}

impl From<InferenceError> for MaintenanceError {
    fn from(e: InferenceError) -> Self {
        MaintenanceError::Summarization {
            reason: e.to_string(),
        }
    }
}
