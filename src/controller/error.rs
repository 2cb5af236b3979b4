//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::time::Duration;
use thiserror::Error;

use crate::pdapi::PdApiError;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// The work is not finished yet; retry later without treating it as a failure
    #[error("{0}")]
    Requeue(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Optimistic concurrency conflict on update
    #[error("Conflict: {0}")]
    Conflict(String),

    /// PD HTTP API error
    #[error("PD API error: {0}")]
    PdApi(#[from] PdApiError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Errors from several pipeline stages
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    if messages.len() == 1 {
        messages.concat()
    } else {
        format!("[{}]", messages.join(", "))
    }
}

/// Build a requeue error from a format string.
#[macro_export]
macro_rules! requeue {
    ($($arg:tt)*) => {
        $crate::controller::error::Error::Requeue(format!($($arg)*))
    };
}

impl Error {
    /// Combine stage errors; an empty list is success.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            Error::PdApi(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Check if this error is an update conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }

    /// True for an explicit requeue, or an aggregate made only of requeues
    pub fn is_requeue(&self) -> bool {
        match self {
            Error::Requeue(_) => true,
            Error::Aggregate(errors) => !errors.is_empty() && errors.iter().all(Error::is_requeue),
            _ => false,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, conflicts and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err)
                        if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Requeue(_) | Error::Transient(_) | Error::Conflict(_) | Error::PdApi(_) => true,
            Error::Aggregate(errors) => errors.iter().any(Error::is_retryable),
            Error::Validation(_) | Error::Serialization(_) => false,
        }
    }

    /// First retry delay for this error; later retries double it
    pub fn requeue_after(&self) -> Duration {
        if self.is_requeue() {
            Duration::from_secs(1)
        } else if self.is_retryable() {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(60)
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
