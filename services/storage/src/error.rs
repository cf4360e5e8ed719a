//! Error types for warehouse store operations.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to the warehouse store
#[derive(Error, Debug)]
pub enum StoreError {
    /// The persistence layer cannot be reached. Fatal for the current pass or request.
    #[error("Warehouse unavailable: {0}")]
    Unavailable(String),

    /// A store operation exceeded its time budget
    #[error("Warehouse operation timed out after {0:?}")]
    Timeout(Duration),

    /// Caller supplied an out-of-range parameter
    #[error("Invalid query parameter `{name}`: {reason}")]
    InvalidQueryParameter { name: &'static str, reason: String },

    /// A row violated a data-model invariant and was refused
    #[error("Invalid {entity} row: {reason}")]
    InvalidRow { entity: &'static str, reason: String },

    /// The query reached the store but failed there
    #[error("Warehouse query failed: {0}")]
    Query(#[source] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Convenience type alias for store results
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Connectivity failures that may succeed on a single retry
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }

    /// Connectivity loss. Fatal for a batch pass; a timeout is not.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub(crate) fn invalid_limit(limit: i64) -> Self {
        StoreError::InvalidQueryParameter {
            name: "limit",
            reason: format!("must be a positive integer, got {limit}"),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            other => StoreError::Query(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_are_transient() {
        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_transient());

        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_timeout_is_transient_but_not_unavailable() {
        let err = StoreError::Timeout(Duration::from_secs(30));
        assert!(err.is_transient());
        assert!(!err.is_unavailable());
        assert!(StoreError::Unavailable("refused".to_string()).is_unavailable());
    }

    #[test]
    fn test_invalid_limit_is_not_retried() {
        let err = StoreError::invalid_limit(-5);
        assert!(!err.is_transient());
        assert!(err.to_string().contains("-5"));
    }
}
