use thiserror::Error;

use crate::job::JobId;

/// Errors surfaced across the worker/store boundary.
///
/// Ownership loss is normally reported through `false` return values from
/// the store; [`QueueError::OwnershipLost`] exists for callers that need to
/// turn that signal into an error of their own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("invalid job: {0}")]
    Validation(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("ownership of job {0} lost")]
    OwnershipLost(JobId),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("store corruption: {0}")]
    StoreCorruption(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl QueueError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::StoreUnavailable(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        QueueError::Validation(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        QueueError::StoreUnavailable(msg.into())
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        QueueError::StoreCorruption(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Map a Postgres SQLSTATE to an error kind.
///
/// Only connection loss (08), resource exhaustion (53), operator intervention
/// (57P) and serialization or deadlock aborts are worth retrying. Data
/// exceptions (22) and constraint violations (23) reject the input.
#[cfg(any(feature = "postgres", test))]
pub(crate) fn classify_sqlstate(code: &str, detail: String) -> QueueError {
    let retryable = matches!(code, "40001" | "40P01")
        || ["08", "53", "57P"].iter().any(|class| code.starts_with(class));
    if retryable {
        QueueError::StoreUnavailable(detail)
    } else if code.starts_with("22") || code.starts_with("23") {
        QueueError::Validation(detail)
    } else {
        QueueError::StoreCorruption(detail)
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) => classify_sqlstate(&code, err.to_string()),
                None => QueueError::StoreCorruption(err.to_string()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => QueueError::StoreUnavailable(err.to_string()),
            sqlx::Error::Configuration(_) => QueueError::Config(err.to_string()),
            _ => QueueError::StoreCorruption(err.to_string()),
        }
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        QueueError::Artifact(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::StoreCorruption(err.to_string())
    }
}
