use std::time::Duration;

use thiserror::Error;

use crate::run::RunStatus;
use crate::validator::ValidationFailure;

#[derive(Error, Debug)]
pub enum ReportingError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited by remote service after {attempts} attempts")]
    RateLimited { attempts: u32 },

    #[error("Agent reported failure: {0}")]
    Agent(String),

    #[error("Structured output failed validation: {0}")]
    Validation(ValidationFailure),

    #[error("Run timed out after {elapsed:?}")]
    TimedOut { elapsed: Duration },

    #[error("Run {0} was cancelled")]
    Cancelled(String),

    #[error("Run {run_id} has not finished (status {status:?})")]
    NotFinished { run_id: String, status: RunStatus },

    #[error("Run {0} has no raw result to validate")]
    NoResult(String),

    #[error("Run {0} is already being driven")]
    DriverActive(String),

    #[error("Invalid transition for run {run_id}: {from:?} cannot accept {attempted}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        attempted: String,
    },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Unknown upload: {0}")]
    UnknownFile(String),

    #[error("Upload {id} is not available: {reason}")]
    FileUnavailable { id: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[cfg(feature = "openai")]
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl ReportingError {
    pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> Self {
        Self::Storage("lock poisoned by a panicked writer".to_string())
    }
}

impl From<ValidationFailure> for ReportingError {
    fn from(failure: ValidationFailure) -> Self {
        Self::Validation(failure)
    }
}

pub type Result<T> = std::result::Result<T, ReportingError>;

/// Failure observed at the remote agent boundary, before the orchestrator
/// classifies it into a run outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_cause() {
        let err = ReportingError::RateLimited { attempts: 4 };
        assert_eq!(
            err.to_string(),
            "Rate limited by remote service after 4 attempts"
        );

        let err = ReportingError::InvalidTransition {
            run_id: "run-1".to_string(),
            from: RunStatus::Succeeded,
            attempted: "Polled".to_string(),
        };
        assert!(err.to_string().contains("Succeeded"));
        assert!(err.to_string().contains("Polled"));
    }

    #[test]
    fn test_remote_error_display() {
        let err = RemoteError::Rejected {
            status: 400,
            message: "bad assistant".to_string(),
        };
        assert_eq!(err.to_string(), "request rejected (400): bad assistant");
    }
}
