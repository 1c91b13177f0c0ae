//! # Storage Error Types

use thiserror::Error;

/// Result type alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file can't be created
    /// - File permissions issue
    /// - Disk full
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A read or write query failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// The store was closed.
    #[error("Store is closed")]
    Closed,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => StoreError::Closed,
            sqlx::Error::PoolTimedOut => StoreError::ConnectionFailed("pool timed out".into()),
            other => StoreError::QueryFailed(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::MigrationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_closed_maps_to_closed() {
        assert!(matches!(StoreError::from(sqlx::Error::PoolClosed), StoreError::Closed));
    }

    #[test]
    fn test_other_errors_map_to_query_failed() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::QueryFailed(_)));
    }
}
