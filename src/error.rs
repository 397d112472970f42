//! Error taxonomy.
//!
//! Fallible functions return [`anyhow::Result`]. Where a caller needs to
//! tell failures apart, the error is raised as a [`RagError`] and can be
//! classified with `err.downcast_ref::<RagError>()`.
//!
//! | Variant | Raised when |
//! |---------|-------------|
//! | `Validation` | empty or contradictory inputs |
//! | `Configuration` | missing/unknown backend, bad path or option |
//! | `NotFound` | document or job absent |
//! | `Service` | downstream backend or HTTP failure |
//! | `PartialFailure` | some branches of a fan-out failed |
//! | `Transient` | retryable HTTP failure (429/5xx, network) |
//! | `Closed` | the component was closed |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{component} {operation} failed: {message}")]
    Service {
        component: String,
        operation: String,
        message: String,
    },

    #[error("partial failure: {}", format_failures(.failures))]
    PartialFailure { failures: Vec<(String, String)> },

    #[error("transient error: {0}")]
    Transient(String),

    #[error("{0} is closed")]
    Closed(String),
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(branch, err)| format!("{}: {}", branch, err))
        .collect::<Vec<_>>()
        .join("; ")
}

impl RagError {
    pub fn validation(msg: impl Into<String>) -> anyhow::Error {
        RagError::Validation(msg.into()).into()
    }

    pub fn configuration(msg: impl Into<String>) -> anyhow::Error {
        RagError::Configuration(msg.into()).into()
    }

    pub fn not_found(msg: impl Into<String>) -> anyhow::Error {
        RagError::NotFound(msg.into()).into()
    }

    pub fn service(
        component: impl Into<String>,
        operation: impl Into<String>,
        err: impl std::fmt::Display,
    ) -> anyhow::Error {
        RagError::Service {
            component: component.into(),
            operation: operation.into(),
            message: err.to_string(),
        }
        .into()
    }

    pub fn closed(component: impl Into<String>) -> anyhow::Error {
        RagError::Closed(component.into()).into()
    }

    /// Names of the failed branches for a `PartialFailure`.
    pub fn failed_branches(&self) -> Vec<&str> {
        match self {
            RagError::PartialFailure { failures } => {
                failures.iter().map(|(b, _)| b.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Classify an `anyhow` error, if it carries a [`RagError`].
pub fn kind_of(err: &anyhow::Error) -> Option<&RagError> {
    err.downcast_ref::<RagError>()
}

/// Whether `err` is a retryable failure.
pub fn is_transient(err: &anyhow::Error) -> bool {
    matches!(kind_of(err), Some(RagError::Transient(_)))
}
